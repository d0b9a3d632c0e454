// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::disallowed_macros,
    clippy::uninlined_format_args
)]

use std::net::SocketAddr;

use bytes::Bytes;
use reqwest::StatusCode;
use tokio::net::TcpListener;
use tokio::time::Duration;

use trickle_client::{TricklePublisher, TrickleSubscriber};
use trickle_core::{ChangefeedEvent, TrickleError};
use trickle_server::Config;

async fn start_test_server(config: Config) -> Option<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return None,
        Err(e) => panic!("Failed to bind test server listener: {e}"),
    };
    let addr = listener.local_addr().unwrap();

    let server_handle = tokio::spawn(async move {
        let (app, _state) = trickle_server::server::create_app(config);
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    Some((addr, server_handle))
}

macro_rules! require_server {
    ($config:expr) => {
        match start_test_server($config).await {
            Some(started) => started,
            None => {
                eprintln!("Skipping HTTP test: local TCP bind not permitted");
                return;
            },
        }
    };
}

#[tokio::test]
async fn single_producer_single_subscriber() {
    let _ = tracing_subscriber::fmt::try_init();
    let (addr, _server) = require_server!(Config::default());
    let base = format!("http://{addr}");

    // Subscriber attaches at "latest" before anything is published; the
    // placeholder for seq 0 holds the long-poll open.
    let subscriber = TrickleSubscriber::new(&format!("{base}/s")).unwrap();
    let first_read = tokio::spawn(async move {
        let part = subscriber.read().await;
        (subscriber, part)
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let publisher = TricklePublisher::new(&format!("{base}/s")).unwrap();
    let mut writer = publisher.next().await.unwrap();
    writer.write(Bytes::from_static(b"hello")).await.unwrap();
    writer.finish().await.unwrap();

    let (subscriber, part) = first_read.await.unwrap();
    let part = part.unwrap();
    assert_eq!(part.seq(), 0);
    assert_eq!(part.bytes().await.unwrap(), Bytes::from_static(b"hello"));

    let mut writer = publisher.next().await.unwrap();
    writer.write(Bytes::from_static(b"world")).await.unwrap();
    writer.finish().await.unwrap();

    let part = subscriber.read().await.unwrap();
    assert_eq!(part.seq(), 1);
    assert_eq!(part.bytes().await.unwrap(), Bytes::from_static(b"world"));
}

#[tokio::test]
async fn out_of_window_read_resyncs_from_latest_header() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut config = Config::default();
    config.server.window = 3;
    let (addr, _server) = require_server!(config);
    let base = format!("http://{addr}");

    let http = reqwest::Client::new();
    for seq in 0..=4 {
        let resp = http
            .put(format!("{base}/s/{seq}"))
            .body(format!("segment-{seq}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let subscriber = TrickleSubscriber::new(&format!("{base}/s")).unwrap();
    subscriber.set_seq(0).await;

    match subscriber.read().await {
        Err(TrickleError::SequenceNonexistent { requested, latest }) => {
            assert_eq!(requested, 0);
            assert_eq!(latest, 4);
            subscriber.set_seq(latest).await;
        },
        other => panic!("expected out-of-window error, got {:?}", other.map(|p| p.seq())),
    }

    let part = subscriber.read().await.unwrap();
    assert_eq!(part.seq(), 4);
    assert_eq!(part.bytes().await.unwrap(), Bytes::from_static(b"segment-4"));
}

#[tokio::test]
async fn put_conflicts_and_lookahead_are_rejected() {
    let _ = tracing_subscriber::fmt::try_init();
    let (addr, _server) = require_server!(Config::default());
    let base = format!("http://{addr}");
    let http = reqwest::Client::new();

    let resp = http.put(format!("{base}/s/0")).body("x").send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Same seq again: conflict.
    let resp = http.put(format!("{base}/s/0")).body("y").send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    // Way past the write lookahead (latest=0, lookahead=4): conflict.
    let resp = http.put(format!("{base}/s/9")).body("z").send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    // Reads past the lookahead carry the latest seq for resync.
    let resp = http.get(format!("{base}/s/9")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(resp.headers().get("Lp-Trickle-Latest").unwrap(), "0");

    // Malformed seqs are rejected outright.
    let resp = http.get(format!("{base}/s/abc")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn explicit_create_and_autocreate_policy() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut config = Config::default();
    config.server.autocreate = false;
    let (addr, _server) = require_server!(config);
    let base = format!("http://{addr}");
    let http = reqwest::Client::new();

    // No autocreate: writes to an unknown stream are refused.
    let resp = http.put(format!("{base}/s/0")).body("x").send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = http.post(format!("{base}/s/")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = http.post(format!("{base}/s/")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = http.put(format!("{base}/s/0")).body("x").send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn delete_drains_waiting_reads_with_eos() {
    let _ = tracing_subscriber::fmt::try_init();
    let (addr, _server) = require_server!(Config::default());
    let base = format!("http://{addr}");
    let http = reqwest::Client::new();

    let resp = http.put(format!("{base}/s/0")).body("x").send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let subscriber = TrickleSubscriber::new(&format!("{base}/s")).unwrap();
    subscriber.set_seq(1).await;
    let pending_read = tokio::spawn(async move {
        let outcome = subscriber.read().await;
        (subscriber, outcome)
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let resp = http.delete(format!("{base}/s/")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let (subscriber, outcome) = pending_read.await.unwrap();
    assert!(matches!(outcome, Err(TrickleError::EndOfStream)));

    // The stream is gone from the registry now.
    assert!(matches!(subscriber.read().await, Err(TrickleError::StreamNotFound)));

    let resp = http.delete(format!("{base}/s/")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn long_poll_timeout_marker_keeps_position() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut config = Config::default();
    config.server.read_timeout_secs = 1;
    let (addr, _server) = require_server!(config);
    let base = format!("http://{addr}");
    let http = reqwest::Client::new();

    let resp = http.put(format!("{base}/s/0")).body("x").send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let subscriber = TrickleSubscriber::new(&format!("{base}/s")).unwrap();
    subscriber.set_seq(1).await;

    let part = subscriber.read().await.unwrap();
    assert!(part.timed_out());
    assert_eq!(part.seq(), 1);
    assert_eq!(part.bytes().await.unwrap(), Bytes::new());

    // Position is unchanged: the next read asks for the same seq.
    assert_eq!(subscriber.next_seq().await, 1);
}

#[tokio::test]
async fn changefeed_reports_adds_and_removes_over_http() {
    let _ = tracing_subscriber::fmt::try_init();
    let (addr, _server) = require_server!(Config::default());
    let base = format!("http://{addr}");
    let http = reqwest::Client::new();

    let resp = http.post(format!("{base}/cam/")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = http.delete(format!("{base}/cam/")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let subscriber = TrickleSubscriber::new(&format!("{base}/CHANGEFEED")).unwrap();
    subscriber.set_seq(0).await;

    let part = subscriber.read().await.unwrap();
    assert_eq!(part.seq(), 0);
    let event: ChangefeedEvent = serde_json::from_slice(&part.bytes().await.unwrap()).unwrap();
    assert_eq!(event.added, vec!["cam".to_string()]);
    assert!(event.removed.is_empty());

    let part = subscriber.read().await.unwrap();
    assert_eq!(part.seq(), 1);
    let event: ChangefeedEvent = serde_json::from_slice(&part.bytes().await.unwrap()).unwrap();
    assert!(event.added.is_empty());
    assert_eq!(event.removed, vec!["cam".to_string()]);

    // The changefeed itself is not writable.
    let resp = http.put(format!("{base}/CHANGEFEED/5")).body("x").send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn content_type_is_sticky_per_stream() {
    let _ = tracing_subscriber::fmt::try_init();
    let (addr, _server) = require_server!(Config::default());
    let base = format!("http://{addr}");
    let http = reqwest::Client::new();

    let resp = http
        .put(format!("{base}/s/0"))
        .header("Content-Type", "video/mp2t")
        .body("ts-bytes")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = http.get(format!("{base}/s/0")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("Content-Type").unwrap(), "video/mp2t");
    assert_eq!(resp.headers().get("Lp-Trickle-Seq").unwrap(), "0");
    assert_eq!(resp.bytes().await.unwrap(), Bytes::from_static(b"ts-bytes"));
}

#[tokio::test]
async fn server_works_under_a_nested_base_path() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut config = Config::default();
    config.server.base_path = "/media/".to_string();
    let (addr, _server) = require_server!(config);
    let base = format!("http://{addr}/media");
    let http = reqwest::Client::new();

    let resp = http.put(format!("{base}/s/0")).body("x").send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Outside the base path nothing is routed.
    let resp = http.get(format!("http://{addr}/s/0")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let subscriber = TrickleSubscriber::new(&format!("{base}/s")).unwrap();
    subscriber.set_seq(0).await;
    let part = subscriber.read().await.unwrap();
    assert_eq!(part.bytes().await.unwrap(), Bytes::from_static(b"x"));
}
