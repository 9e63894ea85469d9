// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use logpush_ingest::config::IngesterOptions;
use logpush_ingest::forwarder::Forwarder;
use logpush_ingest::ingest_handler::IngestHandler;
use logpush_ingest::model::{ForwardBatch, Labels, StreamRecord};
use logpush_ingest::server::IngestServer;
use logpush_ingest::stream_cache::{StreamCache, DEFAULT_STREAM_CACHE_TTL};
use logpush_ingest::stream_store::MemoryStreamStore;

/// Hands every batch to the test through a channel.
pub struct ChannelForwarder {
    tx: mpsc::UnboundedSender<ForwardBatch>,
}

impl ChannelForwarder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ForwardBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelForwarder { tx }, rx)
    }
}

#[async_trait]
impl Forwarder for ChannelForwarder {
    async fn ingest(&self, batch: ForwardBatch) {
        let _ = self.tx.send(batch);
    }
}

pub fn test_stream(name: &str, labels: &[(&str, &str)]) -> StreamRecord {
    StreamRecord {
        id: Uuid::new_v4(),
        name: name.to_string(),
        created_at: Utc::now(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<Labels>(),
        token: None,
    }
}

/// Starts an ingest server on an ephemeral port and returns its address.
pub async fn start_server(
    streams: Vec<StreamRecord>,
    forwarder: Arc<dyn Forwarder + Send + Sync>,
) -> SocketAddr {
    let store = Arc::new(MemoryStreamStore::new(streams));
    let cache = Arc::new(StreamCache::new(store, DEFAULT_STREAM_CACHE_TTL));
    let handler = Arc::new(IngestHandler::new(
        IngesterOptions::default(),
        cache,
        forwarder,
    ));

    let listener = IngestServer::bind("127.0.0.1:0")
        .await
        .expect("unable to bind test listener");
    let addr = listener.local_addr().expect("listener has no address");

    tokio::spawn(async move {
        let _ = IngestServer::new(handler).serve(listener).await;
    });

    addr
}

pub const THREE_ENTRY_BATCH: &str = r#"{
    "meta": {"app": "storefront"},
    "entries": [
        {"date": 1700000000000, "level": "info", "message": "cart loaded", "meta": {"page": "/cart"}},
        {"date": 1700000000000, "level": "debug", "message": "  \t  "},
        {"date": 1700000000000, "level": "info", "message": "checkout started", "meta": {"page": "/cart"}}
    ]
}"#;

pub async fn push(addr: SocketAddr, stream_id: &str, body: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{addr}/push/stream/{stream_id}"))
        .header("content-type", "application/json")
        .header("x-forwarded-for", "203.0.113.50")
        .body(body.to_string())
        .send()
        .await
        .expect("push request failed")
}
