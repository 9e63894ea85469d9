// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use sqlx::postgres::PgPoolOptions;
use std::{env, process::ExitCode, sync::Arc, time::Duration};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logpush_ingest::{
    config::{Config, SinkConfig},
    forwarder::{Forwarder, LokiForwarder, RelationalForwarder},
    ingest_handler::IngestHandler,
    server::IngestServer,
    stream_cache::StreamCache,
    stream_store::PostgresStreamStore,
};

const DB_MAX_CONNECTIONS: u32 = 16;
const DB_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("LOGPUSH_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let json_logs = env::var("LOG_FMT")
        .map(|val| val.trim().eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    install_subscriber(&log_level, json_logs);

    debug!("Logging subsystem enabled");

    let config = match Config::new() {
        Ok(c) => c,
        Err(e) => {
            error!("Error loading config: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let pool = match PgPoolOptions::new()
        .max_connections(DB_MAX_CONNECTIONS)
        .acquire_timeout(DB_ACQUIRE_TIMEOUT)
        .connect(&config.database_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            error!("Unable to connect to the database: {e}");
            return ExitCode::FAILURE;
        }
    };

    let forwarder: Arc<dyn Forwarder + Send + Sync> = match &config.sink {
        SinkConfig::Loki(loki) => match LokiForwarder::connect(loki.clone()).await {
            Ok(forwarder) => {
                info!("Forwarding to Loki at {}", loki.url.host_str().unwrap_or_default());
                Arc::new(forwarder)
            }
            Err(e) => {
                error!("Unable to connect to Loki: {e}");
                return ExitCode::FAILURE;
            }
        },
        SinkConfig::Relational { insert_timeout } => {
            info!("Forwarding to the stream_entries table");
            Arc::new(RelationalForwarder::new(pool.clone(), *insert_timeout))
        }
    };

    let cache = Arc::new(StreamCache::new(
        Arc::new(PostgresStreamStore::new(pool)),
        config.stream_cache_ttl,
    ));
    let handler = Arc::new(IngestHandler::new(config.ingester.clone(), cache, forwarder));

    let listener = match IngestServer::bind(&config.listen_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Unable to listen on {}: {e}", config.listen_addr());
            return ExitCode::FAILURE;
        }
    };

    match IngestServer::new(handler).serve(listener).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Ingest server stopped: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::expect_used)]
fn install_subscriber(log_level: &str, json_logs: bool) {
    let env_filter = format!("h2=off,hyper=off,rustls=off,sqlx=warn,{}", log_level);

    let builder = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true);

    if json_logs {
        tracing::subscriber::set_global_default(builder.json().finish())
            .expect("setting default subscriber failed");
    } else {
        tracing::subscriber::set_global_default(builder.finish())
            .expect("setting default subscriber failed");
    }
}
