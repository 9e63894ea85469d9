// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

use crate::model::{ForwardBatch, Labels, Level, SanitizedEntry};
use crate::sanitizer::{
    apply_reserved_labels, free_shadow_key, strict_label_key, STREAM_SHADOW_PREFIX,
};

pub const SOURCE_LABEL: &str = "source";
pub const SOURCE_LABEL_VALUE: &str = "web";
pub const SERVICE_NAME_LABEL: &str = "service_name";
pub const TX_LABEL: &str = "logpush_tx";
pub const LEVEL_LABEL: &str = "level";
pub const ENV_LABEL: &str = "env";

/// Entry labels promoted to the indexed `env` label in structured mode, in order of preference.
const ENV_SOURCE_LABELS: [&str; 2] = ["env", "environment"];

/// How entries are laid out on the Loki side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LokiMode {
    /// One Loki stream per distinct label set. Entry labels become indexed labels.
    #[default]
    Labeled,
    /// A single Loki stream per batch; entry labels travel as structured metadata.
    Structured,
}

#[derive(Debug, Serialize)]
pub struct LokiPushRequest {
    pub streams: Vec<LokiStream>,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct LokiStream {
    pub stream: Labels,
    pub values: Vec<LokiValue>,
}

/// One log line: `[ "<unix nanos>", "<line>", {metadata}? ]` on the wire.
#[derive(Debug, PartialEq, Eq)]
pub struct LokiValue {
    pub timestamp_nanos: i64,
    pub line: String,
    pub metadata: Option<Labels>,
}

impl Serialize for LokiValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let metadata = self.metadata.as_ref().filter(|m| !m.is_empty());
        let mut seq = serializer.serialize_seq(Some(if metadata.is_some() { 3 } else { 2 }))?;
        seq.serialize_element(&self.timestamp_nanos.to_string())?;
        seq.serialize_element(&self.line)?;
        if let Some(metadata) = metadata {
            seq.serialize_element(metadata)?;
        }
        seq.end()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LokiTransformer {
    pub mode: LokiMode,
    pub strict_labels: bool,
}

impl LokiTransformer {
    pub fn new(mode: LokiMode, strict_labels: bool) -> Self {
        LokiTransformer {
            mode,
            strict_labels,
        }
    }

    pub fn transform(&self, batch: &ForwardBatch) -> LokiPushRequest {
        let streams = match self.mode {
            LokiMode::Labeled => self.labeled_streams(batch),
            LokiMode::Structured => self.structured_stream(batch).into_iter().collect(),
        };
        LokiPushRequest { streams }
    }

    fn labeled_streams(&self, batch: &ForwardBatch) -> Vec<LokiStream> {
        let mut grouped: BTreeMap<Labels, Vec<LokiValue>> = BTreeMap::new();

        for entry in &batch.entries {
            let mut labels = entry.labels.clone();
            apply_reserved_labels(&mut labels, &entry_service_labels(batch, entry));

            grouped
                .entry(self.finish_labels(labels))
                .or_default()
                .push(loki_value(entry, None));
        }

        grouped
            .into_iter()
            .map(|(stream, values)| LokiStream { stream, values })
            .collect()
    }

    /// The stream carries the service labels, the stream's own labels every entry kept, and an
    /// `env` label when all entries agree on `env` (or else `environment`). Whatever else an entry
    /// has goes into its line metadata, so stream plus metadata never outgrow the entry labels.
    fn structured_stream(&self, batch: &ForwardBatch) -> Option<LokiStream> {
        if batch.entries.is_empty() {
            return None;
        }

        let mut stream: Labels = batch
            .stream_labels
            .iter()
            .filter(|(key, value)| shared_value(&batch.entries, key) == Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        apply_reserved_labels(&mut stream, &base_labels(batch));

        let mut promoted = None;
        if !stream.contains_key(ENV_LABEL) {
            for key in ENV_SOURCE_LABELS {
                if let Some(value) = shared_value(&batch.entries, key) {
                    stream.insert(ENV_LABEL.to_string(), value.clone());
                    promoted = Some(key);
                    break;
                }
                if batch.entries.iter().any(|entry| entry.labels.contains_key(key)) {
                    break;
                }
            }
        }

        let values = batch
            .entries
            .iter()
            .map(|entry| {
                let mut metadata: Labels = entry
                    .labels
                    .iter()
                    .filter(|(key, value)| {
                        Some(key.as_str()) != promoted && stream.get(*key) != Some(*value)
                    })
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                apply_reserved_labels(
                    &mut metadata,
                    &Labels::from([(LEVEL_LABEL.to_string(), entry.level.to_string())]),
                );
                loki_value(entry, Some(self.finish_labels(metadata)))
            })
            .collect();

        Some(LokiStream {
            stream: self.finish_labels(stream),
            values,
        })
    }

    fn finish_labels(&self, labels: Labels) -> Labels {
        if self.strict_labels {
            strict_label_keys(labels)
        } else {
            labels
        }
    }
}

/// Labels every Loki stream of a batch carries.
pub fn base_labels(batch: &ForwardBatch) -> Labels {
    Labels::from([
        (SOURCE_LABEL.to_string(), SOURCE_LABEL_VALUE.to_string()),
        (SERVICE_NAME_LABEL.to_string(), batch.stream.name.clone()),
        (TX_LABEL.to_string(), batch.tx_id.to_string()),
    ])
}

/// Labels the service sets on every entry. The ingester budgets for them while sanitizing, so
/// sinks can add them without going over the label ceiling.
pub fn service_labels(stream_name: &str, tx_id: Uuid, level: Level) -> Labels {
    Labels::from([
        (SOURCE_LABEL.to_string(), SOURCE_LABEL_VALUE.to_string()),
        (SERVICE_NAME_LABEL.to_string(), stream_name.to_string()),
        (TX_LABEL.to_string(), tx_id.to_string()),
        (LEVEL_LABEL.to_string(), level.to_string()),
    ])
}

fn entry_service_labels(batch: &ForwardBatch, entry: &SanitizedEntry) -> Labels {
    service_labels(&batch.stream.name, batch.tx_id, entry.level)
}

/// The value of `key` when every entry has it and they all agree.
fn shared_value<'a>(entries: &'a [SanitizedEntry], key: &str) -> Option<&'a String> {
    let (first, rest) = entries.split_first()?;
    let value = first.labels.get(key)?;
    rest.iter()
        .all(|entry| entry.labels.get(key) == Some(value))
        .then_some(value)
}

fn loki_value(entry: &SanitizedEntry, metadata: Option<Labels>) -> LokiValue {
    LokiValue {
        timestamp_nanos: entry.timestamp_nanos(),
        line: entry.message.clone(),
        metadata,
    }
}

/// Rewrites label keys into Loki's `[a-zA-Z_][a-zA-Z0-9_]*` alphabet. Keys that end up empty
/// are dropped. Keys that were already well-formed keep their name; a rewritten key landing on a
/// taken name moves to an `_opt_` shadow key.
fn strict_label_keys(labels: Labels) -> Labels {
    let mut result = Labels::new();
    let mut rewritten = Vec::new();
    for (key, value) in labels {
        match strict_label_key(&key) {
            Some(strict) if strict == key => {
                result.insert(strict, value);
            }
            Some(strict) => rewritten.push((key, strict, value)),
            None => warn!("Dropping label with ill-formed key '{key}'"),
        }
    }

    for (key, strict, value) in rewritten {
        if result.contains_key(&strict) {
            let shadow = free_shadow_key(&result, STREAM_SHADOW_PREFIX, &strict);
            warn!("Label '{key}' normalizes to taken key '{strict}', keeping it as '{shadow}'");
            result.insert(shadow, value);
        } else {
            result.insert(strict, value);
        }
    }
    result
}

/// One row of the `stream_entries` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRow {
    pub created_at: DateTime<Utc>,
    pub stream_id: Uuid,
    pub tx_id: Option<Uuid>,
    pub level: String,
    pub message: String,
    /// JSON object of the entry labels, `None` when there are none.
    pub metadata: Option<Vec<u8>>,
}

pub fn to_rows(batch: &ForwardBatch) -> Result<Vec<EntryRow>, serde_json::Error> {
    batch
        .entries
        .iter()
        .map(|entry| {
            // the row has its own columns for these
            let service = entry_service_labels(batch, entry);
            let labels: Labels = entry
                .labels
                .iter()
                .filter(|(key, value)| service.get(*key) != Some(*value))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            let metadata = if labels.is_empty() {
                None
            } else {
                Some(serde_json::to_vec(&labels)?)
            };
            Ok(EntryRow {
                created_at: entry.created_at(),
                stream_id: batch.stream.id,
                tx_id: Some(batch.tx_id),
                level: entry.level.to_string(),
                message: entry.message.clone(),
                metadata,
            })
        })
        .collect()
}
