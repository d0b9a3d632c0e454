// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Server-side registry of named streams, plus the changefeed.
//!
//! The hub is a first-class object with an explicit lifetime: construct one
//! per server, share it behind `Arc`. Stream creation and removal are
//! announced on the `CHANGEFEED` pseudo-stream, one JSON event segment per
//! change, which in-process consumers read through a
//! [`LocalSubscriber`](crate::local::LocalSubscriber).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{Result, TrickleError};
use crate::protocol::{self, ChangefeedEvent};
use crate::stream::TrickleStream;

/// Tunables shared by every stream the hub creates.
#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Segments retained per stream; older seqs are evicted.
    pub window: usize,
    /// How many seqs past `latest` a read or preconnected write may reach.
    pub lookahead: i64,
    /// Create streams implicitly on first producer write.
    pub autocreate: bool,
    /// Announce stream add/remove on the `CHANGEFEED` pseudo-stream.
    pub changefeed: bool,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self { window: 8, lookahead: 4, autocreate: true, changefeed: true }
    }
}

/// Registry of live streams.
pub struct StreamHub {
    opts: HubOptions,
    streams: Mutex<HashMap<String, Arc<TrickleStream>>>,
    changefeed: Option<ChangefeedWriter>,
}

struct ChangefeedWriter {
    stream: Arc<TrickleStream>,
    next_seq: Mutex<i64>,
}

impl StreamHub {
    pub fn new(opts: HubOptions) -> Self {
        let changefeed = opts.changefeed.then(|| ChangefeedWriter {
            stream: Arc::new(TrickleStream::new(
                protocol::CHANGEFEED,
                opts.window,
                opts.lookahead,
            )),
            next_seq: Mutex::new(0),
        });
        Self { opts, streams: Mutex::new(HashMap::new()), changefeed }
    }

    pub fn options(&self) -> &HubOptions {
        &self.opts
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<TrickleStream>>>> {
        self.streams
            .lock()
            .map_err(|e| TrickleError::Internal(format!("hub lock poisoned: {e}")))
    }

    /// Look up a stream by name; `CHANGEFEED` resolves to the changefeed.
    pub fn get(&self, name: &str) -> Result<Arc<TrickleStream>> {
        if name == protocol::CHANGEFEED {
            return self
                .changefeed
                .as_ref()
                .map(|cf| Arc::clone(&cf.stream))
                .ok_or(TrickleError::StreamNotFound);
        }
        self.lock()?.get(name).cloned().ok_or(TrickleError::StreamNotFound)
    }

    /// Explicitly create a stream, announcing it on the changefeed.
    pub fn create(&self, name: &str) -> Result<Arc<TrickleStream>> {
        self.check_name(name)?;
        let stream = {
            let mut streams = self.lock()?;
            if streams.contains_key(name) {
                return Err(TrickleError::StreamExists);
            }
            let stream = Arc::new(TrickleStream::new(name, self.opts.window, self.opts.lookahead));
            streams.insert(name.to_string(), Arc::clone(&stream));
            stream
        };
        tracing::info!(stream = %name, "stream created");
        self.announce(&[name.to_string()], &[]);
        Ok(stream)
    }

    /// Resolve the target of a producer write, creating the stream when
    /// autocreate allows it.
    pub fn open_for_publish(&self, name: &str) -> Result<Arc<TrickleStream>> {
        self.check_name(name)?;
        if let Ok(existing) = self.get(name) {
            return Ok(existing);
        }
        if !self.opts.autocreate {
            return Err(TrickleError::StreamNotFound);
        }
        match self.create(name) {
            // A concurrent publisher may have won the race; use theirs.
            Err(TrickleError::StreamExists) => self.get(name),
            other => other,
        }
    }

    /// Mark a stream ended and drop it from the registry. Readers already
    /// attached drain their current segment and then observe end of stream.
    pub fn end(&self, name: &str) -> Result<()> {
        self.check_name(name)?;
        let stream = {
            let mut streams = self.lock()?;
            streams.remove(name).ok_or(TrickleError::StreamNotFound)?
        };
        stream.end();
        tracing::info!(stream = %name, "stream removed");
        self.announce(&[], &[name.to_string()]);
        Ok(())
    }

    pub fn stream_names(&self) -> Vec<String> {
        self.lock().map(|streams| streams.keys().cloned().collect()).unwrap_or_default()
    }

    /// Sweep every stream for placeholder segments no producer claimed
    /// within `ttl`. Returns how many were dropped.
    pub fn collect_stale(&self, ttl: Duration) -> usize {
        let streams: Vec<Arc<TrickleStream>> =
            self.lock().map(|s| s.values().cloned().collect()).unwrap_or_default();
        streams.iter().map(|stream| stream.collect_stale(ttl)).sum()
    }

    fn check_name(&self, name: &str) -> Result<()> {
        // The changefeed name is reserved: readable, never writable.
        if !protocol::is_valid_stream_name(name) || name == protocol::CHANGEFEED {
            return Err(TrickleError::InvalidStreamName(name.to_string()));
        }
        Ok(())
    }

    fn announce(&self, added: &[String], removed: &[String]) {
        let Some(cf) = &self.changefeed else { return };
        let event = ChangefeedEvent { added: added.to_vec(), removed: removed.to_vec() };
        let body = match serde_json::to_vec(&event) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize changefeed event");
                return;
            },
        };
        let Ok(mut next_seq) = cf.next_seq.lock() else { return };
        match cf.stream.begin_write(*next_seq) {
            Ok(segment) => {
                *next_seq += 1;
                if let Err(e) = segment.body().write(&body) {
                    tracing::warn!(error = %e, "changefeed segment rejected the event body");
                }
                segment.body().close();
            },
            Err(e) => {
                tracing::warn!(error = %e, seq = *next_seq, "failed to open changefeed segment");
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::stream::SegmentGet;

    #[test]
    fn create_then_duplicate_conflicts() {
        let hub = StreamHub::new(HubOptions::default());
        hub.create("s").unwrap();
        assert!(matches!(hub.create("s"), Err(TrickleError::StreamExists)));
        assert!(hub.get("s").is_ok());
    }

    #[test]
    fn autocreate_policy() {
        let hub = StreamHub::new(HubOptions { autocreate: false, ..HubOptions::default() });
        assert!(matches!(hub.open_for_publish("s"), Err(TrickleError::StreamNotFound)));

        let hub = StreamHub::new(HubOptions::default());
        hub.open_for_publish("s").unwrap();
        assert_eq!(hub.stream_names(), vec!["s".to_string()]);
    }

    #[test]
    fn end_drops_stream_and_marks_it_ended() {
        let hub = StreamHub::new(HubOptions::default());
        let stream = hub.create("s").unwrap();
        hub.end("s").unwrap();
        assert!(stream.ended());
        assert!(matches!(hub.get("s"), Err(TrickleError::StreamNotFound)));
        assert!(matches!(hub.end("s"), Err(TrickleError::StreamNotFound)));
    }

    #[test]
    fn reserved_and_invalid_names_rejected() {
        let hub = StreamHub::new(HubOptions::default());
        assert!(matches!(hub.create("CHANGEFEED"), Err(TrickleError::InvalidStreamName(_))));
        assert!(matches!(hub.open_for_publish("a b"), Err(TrickleError::InvalidStreamName(_))));
        // The changefeed is still readable.
        assert!(hub.get("CHANGEFEED").is_ok());
    }

    #[tokio::test]
    async fn changefeed_carries_add_and_remove_events() {
        let hub = StreamHub::new(HubOptions::default());
        hub.create("cam").unwrap();
        hub.end("cam").unwrap();

        let feed = hub.get("CHANGEFEED").unwrap();
        for (seq, want_added, want_removed) in
            [(0i64, vec!["cam".to_string()], vec![]), (1i64, vec![], vec!["cam".to_string()])]
        {
            let SegmentGet::Hit { segment, .. } = feed.get(seq).unwrap() else {
                panic!("missing changefeed segment {seq}");
            };
            let body = segment.attach().read_to_end().await;
            let event: ChangefeedEvent = serde_json::from_slice(&body).unwrap();
            assert_eq!(event.added, want_added);
            assert_eq!(event.removed, want_removed);
        }
    }

    #[test]
    fn changefeed_can_be_disabled() {
        let hub = StreamHub::new(HubOptions { changefeed: false, ..HubOptions::default() });
        hub.create("s").unwrap();
        assert!(matches!(hub.get("CHANGEFEED"), Err(TrickleError::StreamNotFound)));
    }
}
