// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Trickle subscriber - sequence-tracking segment reader.
//!
//! Each successful read hands the caller the current segment's response and
//! launches one background GET for the next seq, so by the time the caller
//! finishes draining a segment its successor is usually already connected.
//! At most one preconnect is in flight per subscriber; it is aborted on
//! `set_seq` and on drop.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use trickle_core::{protocol, Result, TrickleError, SEQ_LATEST};

use crate::http::{normalize_stream_url, shared_http_client};

/// How many consecutive preconnect transport failures fail reads fast.
pub const DEFAULT_MAX_PRECONNECT_FAILURES: u32 = 5;

struct SubscriberState {
    idx: i64,
    pending: Option<JoinHandle<Result<reqwest::Response>>>,
    preconnect_failures: u32,
}

/// Sequence-tracking reader over one stream's segments.
pub struct TrickleSubscriber {
    url: String,
    client: &'static reqwest::Client,
    state: Arc<Mutex<SubscriberState>>,
    max_preconnect_failures: u32,
}

impl TrickleSubscriber {
    /// `url` is the stream base, e.g. `http://localhost:2939/cam`. Reading
    /// starts at the latest segment.
    ///
    /// # Errors
    ///
    /// Fails on a malformed or non-http(s) URL.
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            url: normalize_stream_url(url)?,
            client: shared_http_client()?,
            state: Arc::new(Mutex::new(SubscriberState {
                idx: SEQ_LATEST,
                pending: None,
                preconnect_failures: 0,
            })),
            max_preconnect_failures: DEFAULT_MAX_PRECONNECT_FAILURES,
        })
    }

    /// Retrieve the next segment and set up the one after it concurrently.
    ///
    /// # Errors
    ///
    /// - [`TrickleError::EndOfStream`] on the end-of-stream marker.
    /// - [`TrickleError::SequenceNonexistent`] when the tracked seq fell out
    ///   of the server's window; resync with [`Self::set_seq`].
    /// - [`TrickleError::StreamNotFound`] once the stream is gone.
    /// - [`TrickleError::TooManyPreconnects`] after the consecutive
    ///   transport-failure budget is spent; any success resets it.
    pub async fn read(&self) -> Result<SegmentPart> {
        let mut state = self.state.lock().await;
        if state.preconnect_failures > self.max_preconnect_failures {
            tracing::error!(url = %self.url, idx = state.idx, "hit max preconnect failures");
            return Err(TrickleError::TooManyPreconnects);
        }

        let requested = state.idx;
        let result = match state.pending.take() {
            Some(handle) => handle
                .await
                .unwrap_or_else(|e| Err(TrickleError::Transport(format!("preconnect task: {e}")))),
            None => {
                tracing::debug!(url = %self.url, idx = requested, "no preconnect, connecting");
                Self::fetch(self.client, self.url.clone(), requested).await
            },
        };

        let response = match result {
            Ok(response) => {
                state.preconnect_failures = 0;
                response
            },
            Err(e) => {
                state.preconnect_failures += 1;
                return Err(e);
            },
        };

        let response = Self::classify(requested, response)?;

        if response.headers().get(protocol::CLOSED_HEADER).is_some() {
            return Err(TrickleError::EndOfStream);
        }

        let seq = response
            .headers()
            .get(protocol::SEQ_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|seq| *seq >= 0)
            .ok_or_else(|| {
                TrickleError::Transport(format!("missing or malformed {} header", protocol::SEQ_HEADER))
            })?;

        // A declared-empty body is the long-poll timeout marker: the seq had
        // produced nothing yet, so retry it instead of advancing. Real
        // segment bodies are always streamed (no declared length), even when
        // they turn out to hold zero bytes.
        let timed_out = response.content_length() == Some(0);
        state.idx = if timed_out { seq } else { seq + 1 };

        let next = state.idx;
        state.pending = Some(tokio::spawn(Self::fetch(self.client, self.url.clone(), next)));

        Ok(SegmentPart { seq, timed_out, response })
    }

    /// Force the next read to use seq `n`, discarding any preconnect.
    pub async fn set_seq(&self, seq: i64) {
        let mut state = self.state.lock().await;
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
        state.idx = seq;
        state.preconnect_failures = 0;
    }

    /// Seq the next read will request (−1 until the first read resolves).
    pub async fn next_seq(&self) -> i64 {
        self.state.lock().await.idx
    }

    async fn fetch(
        client: &'static reqwest::Client,
        url: String,
        seq: i64,
    ) -> Result<reqwest::Response> {
        let target = format!("{url}/{seq}");
        tracing::debug!(url = %target, "preconnecting");
        client
            .get(target)
            .send()
            .await
            .map_err(|e| TrickleError::Transport(format!("GET for next segment failed: {e}")))
    }

    /// Map server refusals to typed errors; pass successes through.
    fn classify(requested: i64, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let latest = response
            .headers()
            .get(protocol::LATEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());
        match (status.as_u16(), latest) {
            (404, Some(latest)) => Err(TrickleError::SequenceNonexistent { requested, latest }),
            (404 | 410, _) => Err(TrickleError::StreamNotFound),
            _ => Err(TrickleError::Transport(format!("GET segment failed with status {status}"))),
        }
    }
}

impl Drop for TrickleSubscriber {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_lock() {
            if let Some(pending) = state.pending.take() {
                pending.abort();
            }
        }
    }
}

/// One segment handed to the caller, streaming straight off the socket.
pub struct SegmentPart {
    seq: i64,
    timed_out: bool,
    response: reqwest::Response,
}

impl SegmentPart {
    /// Concrete seq served, from the response header.
    pub fn seq(&self) -> i64 {
        self.seq
    }

    /// Whether this is a zero-byte long-poll timeout marker; the subscriber
    /// will request the same seq again on the next read.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Content type the producer declared, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    /// Next chunk of the segment body; `None` when the segment is complete.
    ///
    /// # Errors
    ///
    /// A mid-body transport failure aborts this segment only; the
    /// subscriber's position is already past it.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.response
            .chunk()
            .await
            .map_err(|e| TrickleError::Transport(format!("segment body read failed: {e}")))
    }

    /// Collect the remainder of the segment body.
    pub async fn bytes(self) -> Result<Bytes> {
        self.response
            .bytes()
            .await
            .map_err(|e| TrickleError::Transport(format!("segment body read failed: {e}")))
    }
}
