// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Wire-level names shared by the server and both clients.

use serde::{Deserialize, Serialize};

/// Response header carrying the concrete seq actually served.
pub const SEQ_HEADER: &str = "Lp-Trickle-Seq";

/// Response header carrying the server's current latest seq, for resync.
pub const LATEST_HEADER: &str = "Lp-Trickle-Latest";

/// Response header set (to any non-empty value) on the end-of-stream marker.
pub const CLOSED_HEADER: &str = "Lp-Trickle-Closed";

/// Reserved name of the pseudo-stream carrying stream add/remove events.
pub const CHANGEFEED: &str = "CHANGEFEED";

/// Content type assumed when the producer never declared one.
pub const DEFAULT_MIME: &str = "application/octet-stream";

/// One changefeed segment body: the streams that appeared and disappeared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangefeedEvent {
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
}

/// Stream names are a single path element: `[A-Za-z0-9_\-.]+`.
pub fn is_valid_stream_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}

/// Parse a decimal seq path element. `-1` is the "latest" sentinel; other
/// negative values are rejected.
pub fn parse_seq(raw: &str) -> Option<i64> {
    raw.parse::<i64>().ok().filter(|seq| *seq >= -1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn stream_name_charset() {
        assert!(is_valid_stream_name("cam-1.low_res"));
        assert!(is_valid_stream_name(CHANGEFEED));
        assert!(!is_valid_stream_name(""));
        assert!(!is_valid_stream_name("a/b"));
        assert!(!is_valid_stream_name("über"));
    }

    #[test]
    fn seq_parsing() {
        assert_eq!(parse_seq("0"), Some(0));
        assert_eq!(parse_seq("-1"), Some(-1));
        assert_eq!(parse_seq("12345"), Some(12345));
        assert_eq!(parse_seq("-2"), None);
        assert_eq!(parse_seq("abc"), None);
        assert_eq!(parse_seq(""), None);
    }

    #[test]
    fn changefeed_event_wire_shape() {
        let event = ChangefeedEvent { added: vec!["a".into()], removed: vec![] };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"added":["a"],"removed":[]}"#);

        let decoded: ChangefeedEvent = serde_json::from_str(r#"{"added":["x"]}"#).unwrap();
        assert_eq!(decoded.added, vec!["x".to_string()]);
        assert!(decoded.removed.is_empty());
    }
}
