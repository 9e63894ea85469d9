// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use bytes::Bytes;
use core::time::Duration;
use reqwest::{header, Url};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::ForwardError;
use crate::forwarder::Forwarder;
use crate::http_utils::build_client;
use crate::model::ForwardBatch;
use crate::transformer::{LokiMode, LokiPushRequest, LokiTransformer};

const PUSH_PATH: &str = "/loki/api/v1/push";
const READY_PATH: &str = "/ready";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct LokiConfig {
    /// Scheme, credentials and authority of the Loki API. Path and query are never kept.
    pub url: Url,
    pub mode: LokiMode,
    pub strict_labels: bool,
    pub retries: u32,
    pub retry_delay: Duration,
    pub ready_timeout: Duration,
    pub proxy_url: Option<String>,
}

impl LokiConfig {
    /// Parses a Loki base URL. `?labels=struct` on the URL selects structured mode.
    pub fn from_url(raw: &str) -> Result<Self, ForwardError> {
        let mut url = Url::parse(raw.trim())
            .map_err(|err| ForwardError::InvalidUrl(format!("{raw}: {err}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ForwardError::InvalidUrl(
                "url scheme must be http or https".to_string(),
            ));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(ForwardError::InvalidUrl("url host is not defined".to_string()));
        }

        let structured = url
            .query_pairs()
            .any(|(key, value)| key == "labels" && value == "struct");

        url.set_path("");
        url.set_query(None);
        url.set_fragment(None);

        Ok(LokiConfig {
            url,
            mode: if structured {
                LokiMode::Structured
            } else {
                LokiMode::Labeled
            },
            strict_labels: false,
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            proxy_url: None,
        })
    }
}

pub struct LokiForwarder {
    client: reqwest::Client,
    push_url: Url,
    ready_url: Url,
    transformer: LokiTransformer,
    retries: u32,
    retry_delay: Duration,
    ready_timeout: Duration,
}

impl LokiForwarder {
    pub fn new(config: LokiConfig) -> Result<Self, ForwardError> {
        let client = build_client(config.proxy_url.as_deref(), REQUEST_TIMEOUT)
            .map_err(|err| ForwardError::Client(err.to_string()))?;
        let push_url = config
            .url
            .join(PUSH_PATH)
            .map_err(|err| ForwardError::InvalidUrl(err.to_string()))?;
        let ready_url = config
            .url
            .join(READY_PATH)
            .map_err(|err| ForwardError::InvalidUrl(err.to_string()))?;

        Ok(LokiForwarder {
            client,
            push_url,
            ready_url,
            transformer: LokiTransformer::new(config.mode, config.strict_labels),
            retries: config.retries.max(1),
            retry_delay: config.retry_delay,
            ready_timeout: config.ready_timeout,
        })
    }

    /// Builds the forwarder and waits for Loki to report ready. Failing here is fatal for the
    /// process.
    pub async fn connect(config: LokiConfig) -> Result<Self, ForwardError> {
        let forwarder = LokiForwarder::new(config)?;
        forwarder.wait_ready().await?;
        Ok(forwarder)
    }

    /// Polls `/ready` until it succeeds or the ready timeout runs out.
    pub async fn wait_ready(&self) -> Result<(), ForwardError> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let err = match self.ready(remaining).await {
                Ok(()) => {
                    debug!("Loki at {} is ready", self.ready_url.host_str().unwrap_or_default());
                    return Ok(());
                }
                Err(err) => err,
            };

            if Instant::now() + self.retry_delay >= deadline {
                return Err(ForwardError::NotReady(err.to_string()));
            }
            warn!("Loki is not ready yet: {err}");
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    async fn ready(&self, timeout: Duration) -> Result<(), ForwardError> {
        let response = self
            .client
            .get(self.ready_url.clone())
            .timeout(timeout.max(Duration::from_millis(1)))
            .send()
            .await?;
        check_status(response).await
    }

    /// A single push attempt.
    pub async fn push(&self, body: Bytes) -> Result<(), ForwardError> {
        let response = self
            .client
            .post(self.push_url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        check_status(response).await
    }

    pub fn encode(&self, request: &LokiPushRequest) -> Result<Bytes, ForwardError> {
        Ok(Bytes::from(serde_json::to_vec(request)?))
    }
}

async fn check_status(response: reqwest::Response) -> Result<(), ForwardError> {
    let status = response.status();
    if status.is_success() || status.is_redirection() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(ForwardError::Status {
        status,
        body: body.trim().to_string(),
    })
}

#[async_trait]
impl Forwarder for LokiForwarder {
    async fn ingest(&self, batch: ForwardBatch) {
        let stream_id = batch.stream.id;
        let remote_addr = batch.remote_addr.as_str();

        let request = self.transformer.transform(&batch);
        if request.streams.is_empty() {
            warn!(%stream_id, remote_addr, "Empty log batch, nothing to push to Loki");
            return;
        }

        let body = match self.encode(&request) {
            Ok(body) => body,
            Err(err) => {
                error!(%stream_id, remote_addr, "Failed to encode Loki push request: {err}");
                return;
            }
        };

        for attempt in 1..=self.retries {
            match self.push(body.clone()).await {
                Ok(()) => {
                    debug!(
                        %stream_id,
                        remote_addr,
                        streams = request.streams.len(),
                        entries = batch.entries.len(),
                        "Pushed entries to Loki"
                    );
                    return;
                }
                Err(err) => {
                    error!(
                        %stream_id,
                        remote_addr,
                        attempt,
                        of = self.retries,
                        "Failed to push entries to Loki: {err}"
                    );
                    if attempt < self.retries {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
    }
}
