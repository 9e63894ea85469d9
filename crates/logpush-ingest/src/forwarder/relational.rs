// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use core::time::Duration;
use sqlx::PgPool;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::ForwardError;
use crate::forwarder::Forwarder;
use crate::model::ForwardBatch;
use crate::transformer::{to_rows, EntryRow};

pub const DEFAULT_INSERT_TIMEOUT: Duration = Duration::from_secs(60);

const INSERT_ENTRY: &str = "insert into stream_entries \
    (created_at, stream_id, tx_id, level, message, metadata) \
    values ($1, $2, $3, $4, $5, $6)";

/// Writes batches into the `stream_entries` table, one transaction per batch.
#[derive(Clone)]
pub struct RelationalForwarder {
    pool: PgPool,
    insert_timeout: Duration,
}

impl RelationalForwarder {
    pub fn new(pool: PgPool, insert_timeout: Duration) -> Self {
        RelationalForwarder {
            pool,
            insert_timeout,
        }
    }

    /// Inserts every row inside one transaction. A failed row is logged and skipped, the
    /// database decides what the final commit keeps. Returns the number of rows inserted.
    async fn write(
        &self,
        rows: &[EntryRow],
        stream_id: Uuid,
        remote_addr: &str,
    ) -> Result<usize, ForwardError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for row in rows {
            let res = sqlx::query(INSERT_ENTRY)
                .bind(row.created_at)
                .bind(row.stream_id)
                .bind(row.tx_id)
                .bind(&row.level)
                .bind(&row.message)
                .bind(row.metadata.as_deref())
                .execute(&mut *tx)
                .await;
            match res {
                Ok(_) => inserted += 1,
                Err(err) => error!(%stream_id, remote_addr, "Failed to insert log entry: {err}"),
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }
}

#[async_trait]
impl Forwarder for RelationalForwarder {
    async fn ingest(&self, batch: ForwardBatch) {
        let stream_id = batch.stream.id;
        let remote_addr = batch.remote_addr.as_str();

        let rows = match to_rows(&batch) {
            Ok(rows) => rows,
            Err(err) => {
                error!(%stream_id, remote_addr, "Failed to encode entry metadata: {err}");
                return;
            }
        };
        if rows.is_empty() {
            warn!(%stream_id, remote_addr, "Empty log batch, nothing to insert");
            return;
        }

        match tokio::time::timeout(
            self.insert_timeout,
            self.write(&rows, stream_id, remote_addr),
        )
        .await
        {
            Ok(Ok(inserted)) => {
                debug!(%stream_id, remote_addr, inserted, "Wrote log entries");
            }
            Ok(Err(err)) => {
                error!(%stream_id, remote_addr, "Failed to write log batch, batch dropped: {err}");
            }
            Err(_) => {
                error!(
                    %stream_id,
                    remote_addr,
                    "Log batch insert timed out after {:?}, batch dropped",
                    self.insert_timeout
                );
            }
        }
    }
}
