// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared HTTP plumbing for the publisher and subscriber.

use std::sync::OnceLock;
use std::time::Duration;

use trickle_core::{Result, TrickleError};
use url::Url;

/// Process-wide reqwest client so every publisher and subscriber shares one
/// connection pool.
pub(crate) fn shared_http_client() -> Result<&'static reqwest::Client> {
    static CLIENT: OnceLock<std::result::Result<reqwest::Client, reqwest::Error>> = OnceLock::new();
    CLIENT
        .get_or_init(|| {
            reqwest::Client::builder().connect_timeout(Duration::from_secs(5)).build()
        })
        .as_ref()
        .map_err(|e| TrickleError::Transport(format!("failed to initialize HTTP client: {e}")))
}

/// Validate a stream base URL (`{base}/{stream}`) and strip any trailing
/// slash so seq path elements can be appended uniformly.
pub(crate) fn normalize_stream_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw).map_err(|e| TrickleError::Transport(format!("invalid URL {raw:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => {},
        other => {
            return Err(TrickleError::Transport(format!(
                "unsupported URL scheme {other:?}, only http and https are allowed"
            )));
        },
    }
    if url.host_str().is_none() {
        return Err(TrickleError::Transport(format!("missing host in URL {raw:?}")));
    }
    Ok(raw.trim_end_matches('/').to_string())
}
