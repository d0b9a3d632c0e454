// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Command implementations over the trickle client crate.

use std::time::Duration;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use trickle_client::{SlowConsumerChecker, TricklePublisher, TrickleSubscriber};
use trickle_core::{protocol, ChangefeedEvent, Result, TrickleError, SEQ_LATEST};

const READ_CHUNK_SIZE: usize = 64 * 1024;

fn stream_url(server: &str, stream: &str) -> String {
    let mut base = server.to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    format!("{base}{stream}")
}

/// Chop the input into fixed-size segments and publish them in order,
/// ending the stream once the input is exhausted.
pub async fn run_publish(
    server: &str,
    stream: &str,
    input: Option<&str>,
    segment_bytes: usize,
) -> Result<()> {
    let publisher = TricklePublisher::new(&stream_url(server, stream))?;
    let mut reader: Box<dyn AsyncRead + Send + Unpin> = match input {
        Some(path) => Box::new(File::open(path).await?),
        None => Box::new(tokio::io::stdin()),
    };

    let segment_bytes = segment_bytes.max(1);
    let checker = SlowConsumerChecker::default();
    let mut buf = vec![0u8; READ_CHUNK_SIZE.min(segment_bytes)];

    info!(stream, segment_bytes, "publishing");

    loop {
        // First chunk before opening the writer, so a clean EOF never
        // produces a trailing empty segment.
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        let next_seq = publisher.next_seq().await;
        while !checker.begin_segment(next_seq) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut writer = publisher.next().await?;
        let seq = writer.seq();
        writer.write(Bytes::copy_from_slice(&buf[..n])).await?;
        let mut sent = n;

        while sent < segment_bytes {
            let cap = buf.len().min(segment_bytes - sent);
            let n = reader.read(&mut buf[..cap]).await?;
            if n == 0 {
                break;
            }
            writer.write(Bytes::copy_from_slice(&buf[..n])).await?;
            sent += n;
        }

        writer.finish().await?;
        checker.end_segment();
        debug!(seq, bytes = sent, "segment published");

        if sent < segment_bytes {
            break;
        }
    }

    info!(stream, "input exhausted, ending stream");
    publisher.close().await
}

/// Follow a stream, writing every segment body to the output in order.
pub async fn run_subscribe(
    server: &str,
    stream: &str,
    output: Option<&str>,
    start: i64,
) -> Result<()> {
    let subscriber = TrickleSubscriber::new(&stream_url(server, stream))?;
    if start != SEQ_LATEST {
        subscriber.set_seq(start).await;
    }

    let mut out: Box<dyn AsyncWrite + Send + Unpin> = match output {
        Some(path) => Box::new(File::create(path).await?),
        None => Box::new(tokio::io::stdout()),
    };

    info!(stream, start, "subscribing");

    loop {
        match subscriber.read().await {
            Ok(mut part) => {
                if part.timed_out() {
                    debug!(seq = part.seq(), "long-poll timeout, retrying");
                    continue;
                }
                let seq = part.seq();
                let mut total = 0usize;
                loop {
                    match part.chunk().await {
                        Ok(Some(chunk)) => {
                            total += chunk.len();
                            out.write_all(&chunk).await?;
                            // Flush per chunk so downstream pipes observe
                            // the same latency the wire delivered.
                            out.flush().await?;
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!(seq, error = %e, "segment aborted mid-body, skipping");
                            break;
                        },
                    }
                }
                debug!(seq, bytes = total, "segment received");
            },
            Err(TrickleError::EndOfStream) => {
                info!(stream, "end of stream");
                return Ok(());
            },
            Err(TrickleError::StreamNotFound) => {
                info!(stream, "stream is gone");
                return Ok(());
            },
            Err(TrickleError::SequenceNonexistent { requested, latest }) => {
                warn!(requested, latest, "fell out of the window, resyncing");
                subscriber.set_seq(latest).await;
            },
            Err(e) => return Err(e),
        }
    }
}

/// Tail the changefeed and log every stream add/remove event.
pub async fn run_watch(server: &str) -> Result<()> {
    let subscriber = TrickleSubscriber::new(&stream_url(server, protocol::CHANGEFEED))?;

    info!("watching changefeed");

    loop {
        match subscriber.read().await {
            Ok(part) => {
                if part.timed_out() {
                    continue;
                }
                let seq = part.seq();
                let body = part.bytes().await?;
                match serde_json::from_slice::<ChangefeedEvent>(&body) {
                    Ok(event) => {
                        info!(seq, added = ?event.added, removed = ?event.removed, "changefeed");
                    },
                    Err(e) => warn!(seq, error = %e, "undecodable changefeed event"),
                }
            },
            Err(TrickleError::EndOfStream | TrickleError::StreamNotFound) => return Ok(()),
            Err(TrickleError::SequenceNonexistent { latest, .. }) => {
                subscriber.set_seq(latest).await;
            },
            Err(e) => return Err(e),
        }
    }
}
