// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Trickle publisher - sequence-tracking segment writer.
//!
//! Every segment is a streaming PUT whose body is fed through an in-memory
//! pipe. Handing out the writer for seq N immediately pre-opens the PUT for
//! seq N+1, so the next segment's connection is established while the
//! current one is still being written. Server refusals surface on the next
//! write or on finish, never silently.

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use trickle_core::{Result, TrickleError};

use crate::http::{normalize_stream_url, shared_http_client};
use crate::source::SegmentSource;

const BODY_PIPE_DEPTH: usize = 8;

type BodyChunk = std::result::Result<Bytes, std::io::Error>;

type PutHandle = JoinHandle<std::result::Result<reqwest::Response, reqwest::Error>>;

struct PendingPut {
    seq: i64,
    body_tx: mpsc::Sender<BodyChunk>,
    request: PutHandle,
}

struct PublisherState {
    idx: i64,
    pending: Option<PendingPut>,
}

/// Sequence-tracking writer for one stream.
pub struct TricklePublisher {
    url: String,
    client: &'static reqwest::Client,
    state: Mutex<PublisherState>,
}

impl TricklePublisher {
    /// `url` is the stream base, e.g. `http://localhost:2939/cam`. Writing
    /// starts at seq 0.
    ///
    /// # Errors
    ///
    /// Fails on a malformed or non-http(s) URL.
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            url: normalize_stream_url(url)?,
            client: shared_http_client()?,
            state: Mutex::new(PublisherState { idx: 0, pending: None }),
        })
    }

    /// Writer for the next segment. Opens the PUT for the segment after it
    /// before returning.
    pub async fn next(&self) -> Result<SegmentWriter> {
        let mut state = self.state.lock().await;
        let current = match state.pending.take() {
            Some(pending) => pending,
            None => self.preconnect(state.idx),
        };
        state.idx = current.seq + 1;
        state.pending = Some(self.preconnect(state.idx));
        drop(state);
        Ok(SegmentWriter {
            seq: current.seq,
            body_tx: Some(current.body_tx),
            request: Some(current.request),
        })
    }

    /// Publish one whole segment from `source`.
    ///
    /// On [`TrickleError::StreamNotFound`] the rest of the source is
    /// drained and dropped so a one-shot upstream does not stall.
    ///
    /// # Errors
    ///
    /// Any failure from the writer surface; the publisher's seq still
    /// advances, segments being independent.
    pub async fn write(&self, mut source: SegmentSource) -> Result<()> {
        let mut writer = self.next().await?;
        loop {
            match source.chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = writer.write(chunk).await {
                        if matches!(e, TrickleError::StreamNotFound) {
                            source.discard().await;
                        }
                        return Err(e);
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    // Upstream died; end the segment with what was sent.
                    writer.finish().await?;
                    return Err(e);
                },
            }
        }
        writer.finish().await
    }

    /// Mark the whole stream ended with a DELETE, discarding the pending
    /// preconnect.
    ///
    /// # Errors
    ///
    /// [`TrickleError::StreamNotFound`] if the stream is already gone.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if let Some(pending) = state.pending.take() {
                pending.request.abort();
            }
        }
        let target = format!("{}/", self.url);
        let response = self
            .client
            .delete(target)
            .send()
            .await
            .map_err(|e| TrickleError::Transport(format!("DELETE stream failed: {e}")))?;
        match response.status().as_u16() {
            200 => Ok(()),
            404 | 410 => Err(TrickleError::StreamNotFound),
            status => Err(TrickleError::Transport(format!("DELETE stream failed with status {status}"))),
        }
    }

    /// Seq the next writer will carry.
    pub async fn next_seq(&self) -> i64 {
        self.state.lock().await.idx
    }

    fn preconnect(&self, seq: i64) -> PendingPut {
        let (body_tx, body_rx) = mpsc::channel::<BodyChunk>(BODY_PIPE_DEPTH);
        let target = format!("{}/{seq}", self.url);
        tracing::debug!(url = %target, "pre-opening segment PUT");
        let request = self
            .client
            .put(target)
            .body(reqwest::Body::wrap_stream(ReceiverStream::new(body_rx)))
            .send();
        PendingPut { seq, body_tx, request: tokio::spawn(request) }
    }
}

impl Drop for TricklePublisher {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_lock() {
            if let Some(pending) = state.pending.take() {
                pending.request.abort();
            }
        }
    }
}

/// Write side of one in-flight segment PUT.
pub struct SegmentWriter {
    seq: i64,
    body_tx: Option<mpsc::Sender<BodyChunk>>,
    request: Option<PutHandle>,
}

impl SegmentWriter {
    pub fn seq(&self) -> i64 {
        self.seq
    }

    /// Feed one chunk of the segment body.
    ///
    /// # Errors
    ///
    /// If the server already answered (refusal or transport failure), that
    /// outcome is returned here.
    pub async fn write(&mut self, chunk: Bytes) -> Result<()> {
        let Some(body_tx) = &self.body_tx else {
            return Err(TrickleError::BufferClosed);
        };
        if body_tx.send(Ok(chunk)).await.is_err() {
            // The request completed without consuming the body; fetch why.
            self.body_tx = None;
            return Err(self.conclude().await.err().unwrap_or_else(|| {
                TrickleError::Transport("segment body pipe closed early".to_string())
            }));
        }
        Ok(())
    }

    /// End the segment body and wait for the server's verdict.
    ///
    /// # Errors
    ///
    /// 404/410 map to [`TrickleError::StreamNotFound`], 409 to
    /// [`TrickleError::WriteConflict`].
    pub async fn finish(mut self) -> Result<()> {
        self.body_tx = None;
        self.conclude().await
    }

    async fn conclude(&mut self) -> Result<()> {
        let Some(request) = self.request.take() else {
            return Err(TrickleError::Transport("segment already concluded".to_string()));
        };
        let response = request
            .await
            .map_err(|e| TrickleError::Transport(format!("segment PUT task: {e}")))?
            .map_err(|e| TrickleError::Transport(format!("segment PUT failed: {e}")))?;
        match response.status().as_u16() {
            s if (200..300).contains(&s) => Ok(()),
            404 | 410 => Err(TrickleError::StreamNotFound),
            409 => Err(TrickleError::WriteConflict(self.seq)),
            status => {
                Err(TrickleError::Transport(format!("segment PUT failed with status {status}")))
            },
        }
    }
}
