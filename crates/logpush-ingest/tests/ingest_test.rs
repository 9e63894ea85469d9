// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use mockito::{Matcher, Server};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use common::{push, start_server, test_stream, ChannelForwarder, THREE_ENTRY_BATCH};
use logpush_ingest::forwarder::{LokiConfig, LokiForwarder};
use logpush_ingest::transformer::LokiMode;

#[tokio::test]
async fn ingest_forwards_non_blank_entries() {
    let stream = test_stream("storefront", &[("env", "prod")]);
    let stream_id = stream.id;
    let (forwarder, mut batches) = ChannelForwarder::new();
    let addr = start_server(vec![stream], Arc::new(forwarder)).await;

    let response = push(addr, &stream_id.to_string(), THREE_ENTRY_BATCH).await;
    assert_eq!(response.status(), 204);

    let batch = timeout(Duration::from_secs(5), batches.recv())
        .await
        .expect("no batch forwarded")
        .expect("forwarder channel closed");

    assert_eq!(batch.entries.len(), 2);
    assert_eq!(batch.remote_addr, "203.0.113.50");
    assert_eq!(batch.entries[0].message, "cart loaded");
    assert_eq!(batch.entries[1].message, "checkout started");
    assert_eq!(
        batch.entries[1].timestamp_nanos() - batch.entries[0].timestamp_nanos(),
        2
    );
    assert_eq!(
        batch.entries[0].labels.get("env").map(String::as_str),
        Some("prod")
    );
}

#[tokio::test]
async fn health_and_unknown_routes() {
    let (forwarder, _batches) = ChannelForwarder::new();
    let addr = start_server(vec![], Arc::new(forwarder)).await;
    let client = reqwest::Client::new();

    let health = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 204);

    let missing = client
        .get(format!("http://{addr}/streams"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn unknown_stream_is_404() {
    let (forwarder, _batches) = ChannelForwarder::new();
    let addr = start_server(vec![], Arc::new(forwarder)).await;

    let response = push(addr, &uuid::Uuid::new_v4().to_string(), THREE_ENTRY_BATCH).await;
    assert_eq!(response.status(), 404);
    let body = response.text().await.unwrap();
    assert!(body.ends_with(" not found\r\n"));
}

#[tokio::test]
async fn ingest_pushes_to_loki() {
    let mut loki = Server::new_async().await;
    let _ready = loki
        .mock("GET", "/ready")
        .with_status(200)
        .create_async()
        .await;
    let push_mock = loki
        .mock("POST", "/loki/api/v1/push")
        .match_header("content-type", "application/json")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#""service_name":"storefront""#.to_string()),
            Matcher::Regex(r#""cart loaded".*"checkout started""#.to_string()),
            Matcher::Regex(r#""1700000000000000000".*"1700000000000000002""#.to_string()),
        ]))
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let config = LokiConfig {
        mode: LokiMode::Structured,
        ..LokiConfig::from_url(&loki.url()).unwrap()
    };
    let forwarder = LokiForwarder::connect(config).await.unwrap();

    let stream = test_stream("storefront", &[]);
    let stream_id = stream.id;
    let addr = start_server(vec![stream], Arc::new(forwarder)).await;

    let response = push(addr, &stream_id.to_string(), THREE_ENTRY_BATCH).await;
    assert_eq!(response.status(), 204);

    let delivered = timeout(Duration::from_secs(5), async {
        while !push_mock.matched_async().await {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(delivered.is_ok(), "loki never received the batch");
}

#[tokio::test]
async fn failing_loki_does_not_change_response() {
    let mut loki = Server::new_async().await;
    let push_mock = loki
        .mock("POST", "/loki/api/v1/push")
        .with_status(503)
        .expect(3)
        .create_async()
        .await;

    let config = LokiConfig {
        retry_delay: Duration::from_millis(5),
        ..LokiConfig::from_url(&loki.url()).unwrap()
    };
    let forwarder = LokiForwarder::new(config).unwrap();

    let stream = test_stream("storefront", &[]);
    let stream_id = stream.id;
    let addr = start_server(vec![stream], Arc::new(forwarder)).await;

    let response = push(addr, &stream_id.to_string(), THREE_ENTRY_BATCH).await;
    assert_eq!(response.status(), 204);

    // the forward runs detached; give it time to exhaust its attempts
    sleep(Duration::from_millis(500)).await;
    push_mock.assert_async().await;
}
