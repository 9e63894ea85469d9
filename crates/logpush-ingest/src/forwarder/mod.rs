// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use crate::model::ForwardBatch;

pub mod loki;
pub mod relational;

pub use loki::{LokiConfig, LokiForwarder};
pub use relational::RelationalForwarder;

/// A sink for sanitized batches. Exactly one implementation is active per process.
#[async_trait]
pub trait Forwarder {
    /// Writes the batch to the sink. Failures are logged here and never reach the caller, who
    /// has already been answered by the time this runs.
    async fn ingest(&self, batch: ForwardBatch);
}
