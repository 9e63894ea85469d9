// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub type Labels = BTreeMap<String, String>;

/// A registered log stream. Read-only on the ingestion path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Labels attached to every entry of the stream. Highest merge precedence.
    pub labels: Labels,
    /// Optional static push token.
    pub token: Option<String>,
}

/// Untrusted request body of `POST /push/stream/{id}`.
#[derive(Debug, Default, Deserialize)]
pub struct IngestBatch {
    #[serde(default, deserialize_with = "null_as_default")]
    pub meta: Labels,
    #[serde(default, deserialize_with = "null_as_default")]
    pub entries: Vec<RawEntry>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct RawEntry {
    /// Milliseconds since epoch. Zero or negative means "now".
    #[serde(default)]
    pub date: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub level: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub meta: Labels,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Level {
    Log,
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    /// Normalizes a free-text level. Anything unrecognized is treated as an error so it
    /// does not get lost among lower severities.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "log" => Level::Log,
            "trace" => Level::Trace,
            "debug" => Level::Debug,
            "info" => Level::Info,
            "warn" | "warning" => Level::Warn,
            _ => Level::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Log => "log",
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entry that passed validation and label sanitization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedEntry {
    pub timestamp: DateTime<Utc>,
    /// Position in the inbound batch, used to keep same-millisecond entries ordered.
    pub sequence: usize,
    pub level: Level,
    pub message: String,
    pub labels: Labels,
}

impl SanitizedEntry {
    /// Wire timestamp: the entry time in nanoseconds, offset by the batch sequence.
    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.timestamp.timestamp_millis().saturating_mul(1_000_000))
            .saturating_add(self.sequence as i64)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.timestamp
            .checked_add_signed(Duration::nanoseconds(self.sequence as i64))
            .unwrap_or(self.timestamp)
    }
}

/// Everything a forwarder needs for one inbound batch.
#[derive(Debug, Clone)]
pub struct ForwardBatch {
    pub stream: Arc<StreamRecord>,
    /// The stream's static labels after sanitization, used where a sink needs them on their own.
    pub stream_labels: Labels,
    pub tx_id: Uuid,
    pub remote_addr: String,
    pub entries: Vec<SanitizedEntry>,
}

/// Resolves the entry time: positive millisecond dates are used as is, anything else is "now".
pub fn entry_timestamp(date: i64, now: DateTime<Utc>) -> DateTime<Utc> {
    if date > 0 {
        DateTime::from_timestamp_millis(date).unwrap_or(now)
    } else {
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_normalization() {
        assert_eq!(Level::from_raw("INFO"), Level::Info);
        assert_eq!(Level::from_raw(" warn "), Level::Warn);
        assert_eq!(Level::from_raw("warning"), Level::Warn);
        assert_eq!(Level::from_raw("log"), Level::Log);
        assert_eq!(Level::from_raw("trace"), Level::Trace);
        assert_eq!(Level::from_raw(""), Level::Error);
        assert_eq!(Level::from_raw("fatal"), Level::Error);
        assert_eq!(Level::Debug.to_string(), "debug");
    }

    #[test]
    fn test_batch_decode_tolerates_nulls() {
        let batch: IngestBatch = serde_json::from_str(
            r#"{"meta":null,"entries":[{"date":1700000000000,"level":null,"message":"hi","meta":null}]}"#,
        )
        .unwrap();
        assert!(batch.meta.is_empty());
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].message, "hi");
        assert!(batch.entries[0].level.is_empty());
        assert!(batch.entries[0].meta.is_empty());
    }

    #[test]
    fn test_batch_decode_rejects_non_string_meta() {
        let res: Result<IngestBatch, _> =
            serde_json::from_str(r#"{"meta":{"count":1},"entries":[]}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_entry_timestamp() {
        let now = DateTime::from_timestamp_millis(1_800_000_000_000).unwrap();
        assert_eq!(entry_timestamp(0, now), now);
        assert_eq!(entry_timestamp(-5, now), now);
        assert_eq!(
            entry_timestamp(1_700_000_000_123, now).timestamp_millis(),
            1_700_000_000_123
        );
    }

    #[test]
    fn test_sequence_offsets_wire_timestamp() {
        let ts = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let entry = |sequence| SanitizedEntry {
            timestamp: ts,
            sequence,
            level: Level::Info,
            message: "m".to_string(),
            labels: Labels::new(),
        };
        assert_eq!(entry(0).timestamp_nanos(), 1_700_000_000_000_000_000);
        assert_eq!(entry(2).timestamp_nanos(), 1_700_000_000_000_000_002);
        assert_eq!(
            entry(2).created_at().timestamp_nanos_opt(),
            Some(1_700_000_000_000_000_002)
        );
    }

    #[test]
    fn test_created_at_saturates_at_the_end_of_time() {
        let entry = SanitizedEntry {
            timestamp: DateTime::<Utc>::MAX_UTC,
            sequence: 5,
            level: Level::Info,
            message: "m".to_string(),
            labels: Labels::new(),
        };
        assert_eq!(entry.created_at(), DateTime::<Utc>::MAX_UTC);
        assert!(entry.timestamp_nanos() > 0);
    }
}
