// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use base64::Engine;
use chrono::{DateTime, Utc};
use core::time::Duration;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::{header, http, HeaderMap, Request, StatusCode, Uri};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::IngesterOptions;
use crate::error::{IngestError, StoreError};
use crate::forwarder::Forwarder;
use crate::http_utils::{
    client_address, empty_response, error_response, verify_content_type,
    verify_request_content_length, HttpResponse,
};
use crate::model::{
    entry_timestamp, ForwardBatch, IngestBatch, Labels, Level, SanitizedEntry, StreamRecord,
};
use crate::sanitizer::{clamp_message, sanitize_labels};
use crate::stream_cache::StreamCache;
use crate::transformer::service_labels;

/// Upper bound of the random delay before a credential mismatch is answered.
const AUTH_JITTER_MAX_MS: u64 = 1000;

/// Handles `POST /push/stream/{id}`.
pub struct IngestHandler {
    options: IngesterOptions,
    cache: Arc<StreamCache>,
    forwarder: Arc<dyn Forwarder + Send + Sync>,
}

impl IngestHandler {
    pub fn new(
        options: IngesterOptions,
        cache: Arc<StreamCache>,
        forwarder: Arc<dyn Forwarder + Send + Sync>,
    ) -> Self {
        IngestHandler {
            options,
            cache,
            forwarder,
        }
    }

    /// Answers `204` once the batch is accepted, before it is forwarded. Anything rejected is
    /// answered with a one-line plaintext error.
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        raw_stream_id: &str,
        peer: Option<SocketAddr>,
    ) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let remote_addr = client_address(req.headers(), peer);
        match self.accept(req, raw_stream_id, &remote_addr).await {
            Ok(()) => empty_response(StatusCode::NO_CONTENT),
            Err(err) => {
                // store failures are logged with their cause where they happen
                if err.status().is_client_error() {
                    warn!(
                        stream_id = %raw_stream_id.trim(),
                        %remote_addr,
                        status = err.status().as_u16(),
                        "Rejected log batch: {err}"
                    );
                }
                error_response(&err)
            }
        }
    }

    async fn accept<B>(
        &self,
        req: Request<B>,
        raw_stream_id: &str,
        remote_addr: &str,
    ) -> Result<(), IngestError>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.verify_basic_auth(req.headers()).await?;

        let stream_id = Uuid::parse_str(raw_stream_id.trim())
            .map_err(|_| IngestError::ClientInput("valid stream id required".to_string()))?;

        let stream = match self.cache.resolve(stream_id).await {
            Ok(stream) => stream,
            Err(StoreError::NotFound) => {
                return Err(IngestError::NotFound(format!(
                    "stream '{stream_id}' not found"
                )));
            }
            Err(err) => {
                error!(%stream_id, remote_addr, "Failed to query log stream: {err}");
                return Err(IngestError::Store);
            }
        };

        if let Some(expected) = &stream.token {
            match request_token(req.headers(), req.uri()) {
                None => {
                    return Err(IngestError::Unauthorized(format!(
                        "auth token required for stream '{stream_id}'"
                    )));
                }
                Some(token) if token != *expected => {
                    auth_jitter().await;
                    return Err(IngestError::Forbidden(format!(
                        "auth token rejected for stream '{stream_id}'"
                    )));
                }
                Some(_) => {}
            }
        }

        verify_content_type(req.headers())?;
        verify_request_content_length(req.headers(), self.options.max_payload_size)?;

        let body = Limited::new(req.into_body(), self.options.max_payload_size)
            .collect()
            .await
            .map_err(|err| {
                if err.downcast_ref::<LengthLimitError>().is_some() {
                    IngestError::ClientInput("payload too large".to_string())
                } else {
                    IngestError::ClientInput(format!("failed to read request body: {err}"))
                }
            })?
            .to_bytes();

        let batch: IngestBatch = serde_json::from_slice(&body)
            .map_err(|err| IngestError::ClientInput(format!("invalid batch payload: {err}")))?;

        let tx_id = Uuid::new_v4();
        let entries = self.sanitize_batch(batch, &stream, tx_id, Utc::now(), remote_addr);

        if entries.is_empty() {
            warn!(%stream_id, remote_addr, "Empty log batch");
            return Ok(());
        }

        let (stream_labels, _) = sanitize_labels(
            &self.options.sanitizer,
            &Labels::new(),
            &stream.labels,
            &Labels::new(),
            &Labels::new(),
        );
        let batch = ForwardBatch {
            stream,
            stream_labels,
            tx_id,
            remote_addr: remote_addr.to_string(),
            entries,
        };

        debug!(
            %stream_id,
            remote_addr = %batch.remote_addr,
            tx_id = %batch.tx_id,
            entries = batch.entries.len(),
            "Dispatching log batch"
        );

        // the forward outlives the request and nobody waits for it
        let forwarder = Arc::clone(&self.forwarder);
        tokio::spawn(async move { forwarder.ingest(batch).await });

        Ok(())
    }

    /// Turns the raw batch into entries ready for a forwarder. Entries past `max_entries` and
    /// entries whose message is blank are discarded; the sequence of a kept entry is its index in
    /// the inbound batch. The labels of every entry include the service labels for `tx_id`.
    fn sanitize_batch(
        &self,
        batch: IngestBatch,
        stream: &StreamRecord,
        tx_id: Uuid,
        now: DateTime<Utc>,
        remote_addr: &str,
    ) -> Vec<SanitizedEntry> {
        let stream_id = stream.id;
        let IngestBatch { meta, mut entries } = batch;

        if entries.len() > self.options.max_entries {
            warn!(
                %stream_id,
                remote_addr,
                entries = entries.len(),
                kept = self.options.max_entries,
                "Batch has too many entries, discarding the rest"
            );
            entries.truncate(self.options.max_entries);
        }

        let mut dropped_labels = 0;
        let mut truncated_labels = 0;
        let mut clamped_messages = 0;

        let mut sanitized = Vec::with_capacity(entries.len());
        for (sequence, entry) in entries.into_iter().enumerate() {
            let message = entry.message.trim();
            if message.is_empty() {
                continue;
            }

            let (message, clamped) = clamp_message(message, self.options.max_message_len);
            if clamped {
                clamped_messages += 1;
            }

            let level = Level::from_raw(&entry.level);
            let (labels, report) = sanitize_labels(
                &self.options.sanitizer,
                &service_labels(&stream.name, tx_id, level),
                &stream.labels,
                &meta,
                &entry.meta,
            );
            dropped_labels += report.dropped;
            truncated_labels += report.truncated;

            sanitized.push(SanitizedEntry {
                timestamp: entry_timestamp(entry.date, now),
                sequence,
                level,
                message: message.into_owned(),
                labels,
            });
        }

        if dropped_labels > 0 || truncated_labels > 0 || clamped_messages > 0 {
            warn!(
                %stream_id,
                remote_addr,
                dropped_labels,
                truncated_labels,
                clamped_messages,
                "Batch metadata exceeded ingester limits"
            );
        }

        sanitized
    }

    async fn verify_basic_auth(&self, headers: &HeaderMap) -> Result<(), IngestError> {
        let auth = &self.options.basic_auth;
        if !auth.is_enabled() {
            return Ok(());
        }

        let Some((user, password)) = basic_credentials(headers) else {
            return Err(IngestError::Unauthorized(
                "authorization required".to_string(),
            ));
        };
        if !auth.verify(&user, &password) {
            auth_jitter().await;
            return Err(IngestError::Forbidden("invalid credentials".to_string()));
        }
        Ok(())
    }
}

async fn auth_jitter() {
    let delay = rand::thread_rng().gen_range(0..AUTH_JITTER_MAX_MS);
    tokio::time::sleep(Duration::from_millis(delay)).await;
}

fn authorization(headers: &HeaderMap, scheme: &str) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (found, credentials) = value.trim().split_once(' ')?;
    if !found.eq_ignore_ascii_case(scheme) {
        return None;
    }
    Some(credentials.trim().to_string()).filter(|c| !c.is_empty())
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let encoded = authorization(headers, "basic")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// The stream token, from a bearer `Authorization` header or else the `token` query parameter.
fn request_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    if let Some(token) = authorization(headers, "bearer") {
        return Some(token);
    }
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
