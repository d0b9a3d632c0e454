// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! HTTP surface of the trickle server.
//!
//! Everything lives under the configured base path:
//!
//! - `POST /{stream}/` explicitly creates a stream (409 if it exists)
//! - `POST|PUT /{stream}/{seq}` feeds one segment body
//! - `GET /{stream}/{seq}` long-polls one segment; `-1` means latest
//! - `DELETE /{stream}/` marks the stream ended
//!
//! Segment bodies stream in both directions: a producer's chunks are
//! appended to the segment's drip buffer as they arrive, and every
//! subscriber response streams from its own cursor, so N readers follow one
//! writer with no cross-blocking.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use tokio::time::MissedTickBehavior;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use trickle_core::{
    protocol, ChangefeedEvent, LocalSubscriber, Segment, SegmentGet, StreamHub, TrickleError,
    TrickleStream,
};

use crate::config::Config;
use crate::state::AppState;

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn plaintext(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}

fn build_response(builder: axum::http::response::Builder, body: Body) -> Response {
    builder.body(body).unwrap_or_else(|e| {
        error!(error = %e, "failed to assemble response");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

fn sequence_nonexistent_response(requested: i64, latest: i64) -> Response {
    build_response(
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(protocol::LATEST_HEADER, latest.to_string()),
        Body::from(format!("seq {requested} is outside the window")),
    )
}

/// End-of-stream marker: 200 with the closed header and no body.
fn eos_response(stream: &TrickleStream, seq: i64) -> Response {
    build_response(
        Response::builder()
            .status(StatusCode::OK)
            .header(protocol::SEQ_HEADER, seq.to_string())
            .header(protocol::LATEST_HEADER, stream.latest_seq().to_string())
            .header(protocol::CLOSED_HEADER, "true"),
        Body::empty(),
    )
}

/// Axum handler to explicitly create a stream.
async fn create_stream_handler(
    State(state): State<Arc<AppState>>,
    Path(stream_name): Path<String>,
) -> Response {
    match state.hub.create(&stream_name) {
        Ok(_) => plaintext(StatusCode::OK, ""),
        Err(TrickleError::StreamExists) => plaintext(StatusCode::CONFLICT, "stream exists"),
        Err(TrickleError::InvalidStreamName(_)) => {
            plaintext(StatusCode::NOT_FOUND, "invalid stream name")
        },
        Err(e) => {
            error!(stream = %stream_name, error = %e, "stream create failed");
            plaintext(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        },
    }
}

/// Axum handler to mark a stream ended.
async fn end_stream_handler(
    State(state): State<Arc<AppState>>,
    Path(stream_name): Path<String>,
) -> Response {
    match state.hub.end(&stream_name) {
        Ok(()) => plaintext(StatusCode::OK, ""),
        Err(TrickleError::StreamNotFound | TrickleError::InvalidStreamName(_)) => {
            plaintext(StatusCode::NOT_FOUND, "no such stream")
        },
        Err(e) => {
            error!(stream = %stream_name, error = %e, "stream delete failed");
            plaintext(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        },
    }
}

/// Axum handler for producer segment writes.
async fn publish_segment_handler(
    State(state): State<Arc<AppState>>,
    Path((stream_name, seq)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Some(seq) = protocol::parse_seq(&seq).filter(|seq| *seq >= 0) else {
        return plaintext(StatusCode::BAD_REQUEST, "invalid seq");
    };

    let stream = match state.hub.open_for_publish(&stream_name) {
        Ok(stream) => stream,
        Err(TrickleError::StreamNotFound) => {
            return plaintext(StatusCode::NOT_FOUND, "no such stream");
        },
        Err(TrickleError::InvalidStreamName(_)) => {
            return plaintext(StatusCode::NOT_FOUND, "invalid stream name");
        },
        Err(e) => {
            error!(stream = %stream_name, error = %e, "publish open failed");
            return plaintext(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        },
    };

    let segment = match stream.begin_write(seq) {
        Ok(segment) => segment,
        Err(TrickleError::StreamEnded) => return plaintext(StatusCode::GONE, "stream ended"),
        Err(TrickleError::WriteConflict(_)) => {
            return plaintext(StatusCode::CONFLICT, "seq already written");
        },
        Err(TrickleError::SequenceNonexistent { latest, .. }) => {
            return plaintext(StatusCode::CONFLICT, &format!("seq out of window, latest is {latest}"));
        },
        Err(e) => {
            error!(stream = %stream_name, seq, error = %e, "begin write failed");
            return plaintext(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        },
    };

    if let Some(mime) = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        stream.set_mime_type_if_unset(mime);
    }

    debug!(stream = %stream.name(), seq, "producer write started");

    let write_timeout = state.config.server.write_timeout();
    let mut data = body.into_data_stream();
    loop {
        match tokio::time::timeout(write_timeout, data.next()).await {
            Err(_) => {
                warn!(stream = %stream.name(), seq, "producer body idle too long");
                segment.body().close();
                return plaintext(StatusCode::REQUEST_TIMEOUT, "body idle timeout");
            },
            Ok(None) => break,
            Ok(Some(Ok(chunk))) => {
                if let Err(e) = segment.body().write(&chunk) {
                    // Evicted from the window or the stream ended mid-write.
                    debug!(stream = %stream.name(), seq, error = %e, "segment closed under producer");
                    return plaintext(StatusCode::GONE, "segment closed");
                }
            },
            Ok(Some(Err(e))) => {
                // Producer went away; release readers with what arrived.
                debug!(stream = %stream.name(), seq, error = %e, "producer body error");
                segment.body().close();
                return plaintext(StatusCode::BAD_REQUEST, "body read failed");
            },
        }
    }
    segment.body().close();
    debug!(stream = %stream.name(), seq, bytes = segment.body().len(), "segment complete");
    plaintext(StatusCode::OK, "")
}

/// Axum handler for subscriber segment reads.
async fn get_segment_handler(
    State(state): State<Arc<AppState>>,
    Path((stream_name, seq)): Path<(String, String)>,
) -> Response {
    let Some(seq) = protocol::parse_seq(&seq) else {
        return plaintext(StatusCode::BAD_REQUEST, "invalid seq");
    };

    let stream = match state.hub.get(&stream_name) {
        Ok(stream) => stream,
        Err(_) => return plaintext(StatusCode::NOT_FOUND, "no such stream"),
    };

    match stream.get(seq) {
        Ok(SegmentGet::Hit { segment, seq, latest }) => {
            serve_segment(&state, &stream, &segment, seq, latest).await
        },
        Ok(SegmentGet::Ended) => eos_response(&stream, seq),
        Err(TrickleError::SequenceNonexistent { requested, latest }) => {
            sequence_nonexistent_response(requested, latest)
        },
        Err(e) => {
            error!(stream = %stream_name, seq, error = %e, "segment lookup failed");
            plaintext(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        },
    }
}

async fn serve_segment(
    state: &Arc<AppState>,
    stream: &Arc<TrickleStream>,
    segment: &Arc<Segment>,
    seq: i64,
    latest: i64,
) -> Response {
    let mut cursor = segment.attach();
    debug!(
        stream = %stream.name(),
        seq,
        subscribers = segment.subscriber_count(),
        "subscriber attached"
    );

    // Long-poll for the first byte only; once a segment is flowing, its
    // lifetime is bounded by the producer and the window.
    let first = tokio::time::timeout(state.config.server.read_timeout(), cursor.chunk()).await;

    let mime = stream.mime_type().unwrap_or_else(|| protocol::DEFAULT_MIME.to_string());
    let headers = Response::builder()
        .status(StatusCode::OK)
        .header(protocol::SEQ_HEADER, seq.to_string())
        .header(protocol::LATEST_HEADER, latest.to_string())
        .header(header::CONTENT_TYPE, mime);

    match first {
        Err(_) => {
            // Long-poll expiry. The explicit empty body declares a zero
            // length, which tells the subscriber to retry this same seq;
            // real segment bodies are always streamed without one.
            debug!(stream = %stream.name(), seq, "long-poll timeout");
            build_response(headers, Body::empty())
        },
        Ok(None) => {
            if !segment.write_started() {
                if stream.ended() {
                    return eos_response(stream, seq);
                }
                // Placeholder collected or evicted before any producer
                // claimed it.
                return sequence_nonexistent_response(seq, stream.latest_seq());
            }
            // Producer closed the segment without a single byte; stream the
            // empty body so the subscriber still advances past it.
            build_response(
                headers,
                Body::from_stream(futures::stream::empty::<Result<Bytes, Infallible>>()),
            )
        },
        Ok(Some(first_chunk)) => {
            let body_stream = futures::stream::unfold(
                (Some(first_chunk), cursor),
                |(pending, mut cursor)| async move {
                    if let Some(chunk) = pending {
                        return Some((Ok::<Bytes, Infallible>(chunk), (None, cursor)));
                    }
                    cursor.chunk().await.map(|chunk| (Ok(chunk), (None, cursor)))
                },
            );
            build_response(headers, Body::from_stream(body_stream))
        },
    }
}

/// Build the router and shared state for the given configuration.
pub fn create_app(config: Config) -> (Router, Arc<AppState>) {
    let hub = Arc::new(StreamHub::new(config.server.hub_options()));
    let state = Arc::new(AppState { hub, config: Arc::new(config) });

    let routes = Router::new()
        .route("/{stream}/", post(create_stream_handler).delete(end_stream_handler))
        .route(
            "/{stream}/{seq}",
            get(get_segment_handler).post(publish_segment_handler).put(publish_segment_handler),
        )
        .with_state(Arc::clone(&state));

    let base_path = state.config.server.base_path.trim_end_matches('/').to_string();
    let app = Router::new().route("/healthz", get(health_handler));
    let app = if base_path.is_empty() { app.merge(routes) } else { app.nest(&base_path, routes) };

    (app.layer(TraceLayer::new_for_http()), state)
}

/// Periodically drop placeholder segments whose producer never showed up,
/// waking their parked reads with not-found.
pub fn spawn_stale_collector(state: &Arc<AppState>) {
    let hub = Arc::clone(&state.hub);
    let ttl = state.config.server.stale_segment_ttl();
    let period = (ttl / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let collected = hub.collect_stale(ttl);
            if collected > 0 {
                debug!(collected, "collected stale placeholder segments");
            }
        }
    });
}

/// Tail the hub's own changefeed through the in-process subscriber and log
/// stream arrivals and departures.
pub fn spawn_changefeed_logger(state: &Arc<AppState>) {
    let Ok(mut subscriber) = LocalSubscriber::new(&state.hub, protocol::CHANGEFEED) else {
        return;
    };
    tokio::spawn(async move {
        loop {
            match subscriber.read() {
                Ok(mut part) => {
                    let body = part.reader.read_to_end().await;
                    match serde_json::from_slice::<ChangefeedEvent>(&body) {
                        Ok(event) => {
                            info!(
                                seq = part.seq,
                                added = ?event.added,
                                removed = ?event.removed,
                                "changefeed"
                            );
                        },
                        Err(e) => {
                            warn!(seq = part.seq, error = %e, "undecodable changefeed event");
                        },
                    }
                },
                Err(TrickleError::SequenceNonexistent { latest, .. }) => {
                    subscriber.set_seq(latest);
                },
                Err(e) => {
                    debug!(error = %e, "changefeed logger stopping");
                    break;
                },
            }
        }
    });
}

/// Starts the HTTP server with graceful shutdown on ctrl-c/SIGTERM.
///
/// # Errors
///
/// Returns an error if the listen address does not parse or the server
/// fails to bind.
///
/// # Panics
///
/// Panics if the signal handlers cannot be installed.
pub async fn start_server(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let (app, app_state) = create_app(config.clone());

    let addr: SocketAddr = config.server.address.parse()?;

    spawn_stale_collector(&app_state);
    if config.server.changefeed {
        spawn_changefeed_logger(&app_state);
    }

    // Set up graceful shutdown signal handler
    // These expect() calls are justified and documented in the function's # Panics section
    #[allow(clippy::expect_used)]
    let shutdown_signal = async {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {
                info!("Received CTRL-C signal, initiating graceful shutdown");
            },
            () = terminate => {
                info!("Received SIGTERM signal, initiating graceful shutdown");
            },
        }
    };

    info!(address = %addr, base_path = %config.server.base_path, "Starting trickle server");

    let handle = axum_server::Handle::new();

    // Spawn a task to listen for shutdown signal
    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown_signal.await;
            handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
        }
    });

    axum_server::bind(addr).handle(handle).serve(app.into_make_service()).await.map_err(|e| {
        error!(error = %e, "server error");
        e.into()
    })
}

#[cfg(test)]
mod base_path_tests {
    use super::*;
    use crate::config::normalize_base_path;

    #[test]
    fn nested_and_root_base_paths_build() {
        for base in ["/", "/media/", "/a/b/"] {
            let config = Config {
                server: crate::config::ServerConfig {
                    base_path: normalize_base_path(base),
                    ..Default::default()
                },
                ..Default::default()
            };
            let (_app, state) = create_app(config);
            assert!(state.config.server.base_path.starts_with('/'));
            assert!(state.config.server.base_path.ends_with('/'));
        }
    }
}
