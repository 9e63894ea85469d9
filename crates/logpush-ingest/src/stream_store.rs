// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Labels, StreamRecord};

/// Backing lookup for stream records.
#[async_trait]
pub trait StreamStore {
    /// Returns the stream with the given id, [`StoreError::NotFound`] if it does not exist, or
    /// [`StoreError::Backend`] when the lookup itself failed.
    async fn get(&self, id: Uuid) -> Result<StreamRecord, StoreError>;
}

#[derive(sqlx::FromRow)]
struct StreamRow {
    id: Uuid,
    created_at: DateTime<Utc>,
    name: String,
    labels: Option<Vec<u8>>,
    token: Option<String>,
}

impl StreamRow {
    fn into_record(self) -> StreamRecord {
        StreamRecord {
            labels: parse_stream_labels(self.id, self.labels.as_deref()),
            token: self
                .token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
            id: self.id,
            created_at: self.created_at,
            name: self.name,
        }
    }
}

fn parse_stream_labels(id: Uuid, data: Option<&[u8]>) -> Labels {
    let Some(data) = data else {
        return Labels::new();
    };
    match serde_json::from_slice::<Labels>(data) {
        Ok(labels) => labels,
        Err(err) => {
            warn!(stream_id = %id, "Ignoring malformed stream labels: {err}");
            Labels::new()
        }
    }
}

/// Stream store backed by the `streams` table.
#[derive(Clone)]
pub struct PostgresStreamStore {
    pool: PgPool,
}

impl PostgresStreamStore {
    pub fn new(pool: PgPool) -> Self {
        PostgresStreamStore { pool }
    }
}

#[async_trait]
impl StreamStore for PostgresStreamStore {
    async fn get(&self, id: Uuid) -> Result<StreamRecord, StoreError> {
        let row = sqlx::query_as::<_, StreamRow>(
            "select id, created_at, name, labels, token from streams where id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StreamRow::into_record).ok_or(StoreError::NotFound)
    }
}

/// In-memory stream store. Counts lookups so callers can observe caching behaviour.
#[derive(Default)]
pub struct MemoryStreamStore {
    streams: HashMap<Uuid, StreamRecord>,
    lookups: AtomicUsize,
    fail_with: Option<String>,
}

impl MemoryStreamStore {
    pub fn new(streams: impl IntoIterator<Item = StreamRecord>) -> Self {
        MemoryStreamStore {
            streams: streams.into_iter().map(|s| (s.id, s)).collect(),
            lookups: AtomicUsize::new(0),
            fail_with: None,
        }
    }

    /// A store whose every lookup fails with a backend error.
    pub fn failing(message: &str) -> Self {
        MemoryStreamStore {
            fail_with: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn get(&self, id: Uuid) -> Result<StreamRecord, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_with {
            return Err(StoreError::Backend(message.clone()));
        }
        self.streams.get(&id).cloned().ok_or(StoreError::NotFound)
    }
}
