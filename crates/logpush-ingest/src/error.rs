// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use hyper::StatusCode;

/// Errors that terminate an ingestion request before the batch is dispatched.
///
/// The `Display` output of every variant is the exact one-line message returned to the caller,
/// so none of them may carry internal detail.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("{0}")]
    ClientInput(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("unable to query requested stream")]
    Store,
}

impl IngestError {
    pub fn status(&self) -> StatusCode {
        match self {
            IngestError::ClientInput(_) => StatusCode::BAD_REQUEST,
            IngestError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            IngestError::Forbidden(_) => StatusCode::FORBIDDEN,
            IngestError::NotFound(_) => StatusCode::NOT_FOUND,
            IngestError::Store => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Outcome of a stream store lookup that did not produce a record.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("stream not found")]
    NotFound,

    #[error("stream store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Failures on the sink side. These are only ever logged.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("invalid sink url: {0}")]
    InvalidUrl(String),

    #[error("unable to build http client: {0}")]
    Client(String),

    #[error("http request: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status '{status}': {body}")]
    Status { status: StatusCode, body: String },

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("sink not ready: {0}")]
    NotReady(String),
}
