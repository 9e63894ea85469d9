// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use anyhow::{anyhow, Context};
use core::time::Duration;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;

use crate::forwarder::loki::LokiConfig;
use crate::forwarder::relational::DEFAULT_INSERT_TIMEOUT;
use crate::sanitizer::SanitizerOptions;
use crate::stream_cache::DEFAULT_STREAM_CACHE_TTL;
use crate::transformer::LokiMode;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;

pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 10_000_000;
pub const DEFAULT_MAX_ENTRIES: usize = 1024;
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 16 * 1024;

/// Ingester-wide Basic auth credentials, user to password.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    users: HashMap<String, String>,
}

impl BasicAuth {
    /// Parses `user:password` pairs. Pairs are separated by spaces or commas; the password is
    /// everything after the first colon.
    pub fn from_env_string(env_value: &str) -> Self {
        let normalized = env_value.replace(',', " ");
        let users = normalized
            .split_whitespace()
            .filter_map(|pair| pair.split_once(':'))
            .filter(|(user, _)| !user.is_empty())
            .map(|(user, pass)| (user.to_string(), pass.to_string()))
            .collect();
        BasicAuth { users }
    }

    pub fn is_enabled(&self) -> bool {
        !self.users.is_empty()
    }

    pub fn verify(&self, user: &str, password: &str) -> bool {
        self.users.get(user).is_some_and(|expected| expected == password)
    }
}

#[derive(Debug, Clone)]
pub struct IngesterOptions {
    /// Content-Length ceiling for push requests, in bytes.
    pub max_payload_size: usize,
    /// Entries past this index are discarded.
    pub max_entries: usize,
    /// Message clamp, in characters.
    pub max_message_len: usize,
    pub sanitizer: SanitizerOptions,
    pub basic_auth: BasicAuth,
}

impl Default for IngesterOptions {
    fn default() -> Self {
        IngesterOptions {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_entries: DEFAULT_MAX_ENTRIES,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            sanitizer: SanitizerOptions::default(),
            basic_auth: BasicAuth::default(),
        }
    }
}

/// The one sink this process forwards to.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkConfig {
    Loki(LokiConfig),
    Relational { insert_timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub sink: SinkConfig,
    pub ingester: IngesterOptions,
    pub stream_cache_ttl: Duration,
}

impl Config {
    pub fn new() -> anyhow::Result<Config> {
        let database_url = env::var("DATABASE_URL")
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| anyhow!("DATABASE_URL environment variable is not set"))?;

        let host = env::var("LOGPUSH_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = env_parse("LOGPUSH_PORT", DEFAULT_PORT)?;

        let sink = match env::var("LOKI_URL").ok().filter(|url| !url.trim().is_empty()) {
            Some(url) => SinkConfig::Loki(loki_config(&url)?),
            None => SinkConfig::Relational {
                insert_timeout: Duration::from_secs(env_parse(
                    "RELATIONAL_INSERT_TIMEOUT_SECS",
                    DEFAULT_INSERT_TIMEOUT.as_secs(),
                )?),
            },
        };

        let defaults = SanitizerOptions::default();
        let sanitizer = SanitizerOptions {
            max_key_len: env_size("INGESTER_MAX_LABEL_NAME_LEN", defaults.max_key_len, 10)?,
            max_value_len: env_size("INGESTER_MAX_LABEL_LEN", defaults.max_value_len, 10)?,
            max_labels: env_parse("INGESTER_MAX_LABELS", defaults.max_labels)?,
            max_metadata_size: env_parse("INGESTER_MAX_METADATA_SIZE", defaults.max_metadata_size)?,
            keep_empty_labels: env_flag("INGESTER_KEEP_EMPTY_LABELS"),
            // keys are made Loki-safe before they are budgeted
            strict_keys: matches!(&sink, SinkConfig::Loki(loki) if loki.strict_labels),
        };

        let ingester = IngesterOptions {
            max_payload_size: env_size("INGESTER_MAX_PAYLOAD_SIZE", DEFAULT_MAX_PAYLOAD_SIZE, 1000)?,
            max_entries: env_size("INGESTER_MAX_ENTRIES", DEFAULT_MAX_ENTRIES, 1)?,
            max_message_len: env_size("INGESTER_MAX_MESSAGE_LEN", DEFAULT_MAX_MESSAGE_LEN, 100)?,
            sanitizer,
            basic_auth: env::var("INGESTER_BASIC_AUTH")
                .map(|value| BasicAuth::from_env_string(&value))
                .unwrap_or_default(),
        };

        Ok(Config {
            host,
            port,
            database_url,
            sink,
            ingester,
            stream_cache_ttl: Duration::from_secs(env_parse(
                "STREAM_CACHE_TTL_SECS",
                DEFAULT_STREAM_CACHE_TTL.as_secs(),
            )?),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn loki_config(url: &str) -> anyhow::Result<LokiConfig> {
    let mut config =
        LokiConfig::from_url(url).map_err(|err| anyhow!("LOKI_URL is invalid: {err}"))?;
    if env_flag("LOKI_STRUCTURED_METADATA") {
        config.mode = LokiMode::Structured;
    }
    config.strict_labels = env_flag("LOKI_STRICT_LABELS");
    let retries = env_size("LOKI_RETRIES", config.retries as usize, 1)?;
    config.retries = u32::try_from(retries)
        .map_err(|_| anyhow!("LOKI_RETRIES must be at most {}, got {retries}", u32::MAX))?;
    config.retry_delay = Duration::from_millis(env_parse(
        "LOKI_RETRY_DELAY_MS",
        config.retry_delay.as_millis() as u64,
    )?);
    config.ready_timeout = Duration::from_secs(env_parse(
        "LOKI_READY_TIMEOUT_SECS",
        config.ready_timeout.as_secs(),
    )?);
    config.proxy_url = env::var("HTTPS_PROXY").ok().filter(|p| !p.trim().is_empty());
    Ok(config)
}

fn env_parse<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("{name} has an invalid value '{value}'")),
        _ => Ok(default),
    }
}

fn env_size(name: &str, default: usize, min: usize) -> anyhow::Result<usize> {
    let value = env_parse(name, default)?;
    if value < min {
        return Err(anyhow!("{name} must be at least {min}, got {value}"));
    }
    Ok(value)
}

fn env_flag(name: &str) -> bool {
    env::var(name).is_ok_and(|value| {
        matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}
