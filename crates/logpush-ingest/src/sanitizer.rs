// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Label and metadata normalization.
//!
//! Every entry carries up to three client label tiers which are merged into one map:
//!
//! 1. stream labels (configured on the stream record, highest precedence)
//! 2. batch meta (shared by all entries of one request)
//! 3. entry meta (lowest precedence)
//!
//! On top of those sit the labels the service owns (`source`, `service_name`, ...). They are
//! never rewritten and always admitted, and their size counts against the budget first.
//!
//! A higher tier overwriting a lower one keeps the overwritten value under a shadow key
//! (`_entry_<key>` when batch meta wins over entry meta, `_opt_<key>` when a stream or service
//! label wins). Keys and values are then stripped of non-printable characters, truncated, and
//! admitted against a per-entry byte budget in tier order, so entry meta is always the first
//! thing to go.
//!
//! Nothing in here fails: input is normalized or dropped.

use crate::model::Labels;
use std::borrow::Cow;
use std::collections::BTreeMap;

pub const ENTRY_SHADOW_PREFIX: &str = "_entry_";
pub const STREAM_SHADOW_PREFIX: &str = "_opt_";
pub const KEY_TRUNCATION_MARKER: &str = "___";
pub const VALUE_TRUNCATION_MARKER: &str = " ...";
pub const MESSAGE_TRUNCATION_MARKER: &str = "...";
pub const EMPTY_VALUE_PLACEHOLDER: &str = "[null]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizerOptions {
    /// Maximum label key length in characters, 0 disables truncation.
    pub max_key_len: usize,
    /// Maximum label value length in characters, 0 disables truncation.
    pub max_value_len: usize,
    /// Maximum number of client labels per entry, 0 means unlimited. Service labels don't count.
    pub max_labels: usize,
    /// Byte budget for the sum of `len(key) + len(value)` over all labels, service labels
    /// included, 0 means unlimited.
    pub max_metadata_size: usize,
    /// Keep labels with empty values, replacing them with [`EMPTY_VALUE_PLACEHOLDER`].
    pub keep_empty_labels: bool,
    /// Rewrite keys into the `[a-zA-Z_][a-zA-Z0-9_]*` alphabet, see [`strict_label_key`].
    pub strict_keys: bool,
}

impl Default for SanitizerOptions {
    fn default() -> Self {
        Self {
            max_key_len: 64,
            max_value_len: 1024,
            max_labels: 0,
            max_metadata_size: 16 * 1024,
            keep_empty_labels: false,
            strict_keys: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Tier {
    Entry,
    Batch,
    Stream,
    Service,
}

impl Tier {
    fn shadow_prefix(self) -> &'static str {
        match self {
            Tier::Entry | Tier::Batch => ENTRY_SHADOW_PREFIX,
            Tier::Stream | Tier::Service => STREAM_SHADOW_PREFIX,
        }
    }
}

/// What the sanitizer had to do to fit the labels.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SanitizeReport {
    pub dropped: usize,
    pub truncated: usize,
}

/// Merges the service labels and the three client tiers into one sanitized map.
pub fn sanitize_labels(
    opts: &SanitizerOptions,
    service: &Labels,
    stream: &Labels,
    batch: &Labels,
    entry: &Labels,
) -> (Labels, SanitizeReport) {
    let mut report = SanitizeReport::default();

    let merged = merge_tiers(service, stream, batch, entry);

    let mut candidates: Vec<(Tier, String, String)> = Vec::with_capacity(merged.len());
    for (key, (value, tier)) in merged {
        if tier == Tier::Service {
            candidates.push((tier, key, value));
            continue;
        }

        let key = strip(key.trim());
        let key = if opts.strict_keys {
            strict_label_key(&key)
        } else {
            Some(key).filter(|key| !key.is_empty())
        };
        let Some(key) = key else {
            report.dropped += 1;
            continue;
        };

        let mut value = strip(value.trim());
        if value.is_empty() {
            if !opts.keep_empty_labels {
                report.dropped += 1;
                continue;
            }
            value = EMPTY_VALUE_PLACEHOLDER.to_string();
        }

        let (key, key_truncated) = truncate(&key, opts.max_key_len, KEY_TRUNCATION_MARKER);
        let (value, value_truncated) =
            truncate(&value, opts.max_value_len, VALUE_TRUNCATION_MARKER);
        if key_truncated || value_truncated {
            report.truncated += 1;
        }

        candidates.push((tier, key.into_owned(), value.into_owned()));
    }

    // stable sort keeps key order within a tier
    candidates.sort_by(|a, b| b.0.cmp(&a.0));

    let mut labels = Labels::new();
    let mut used = 0usize;
    let mut client_labels = 0usize;
    for (tier, key, value) in candidates {
        if tier == Tier::Service {
            used += key.len() + value.len();
            labels.insert(key, value);
            continue;
        }

        // two raw keys may collapse into one after stripping or truncation;
        // the one admitted first keeps the name
        let key = if labels.contains_key(&key) {
            free_shadow_key(&labels, tier.shadow_prefix(), &key)
        } else {
            key
        };

        if opts.max_labels > 0 && client_labels >= opts.max_labels {
            report.dropped += 1;
            continue;
        }

        let cost = key.len() + value.len();
        if opts.max_metadata_size > 0 && used + cost > opts.max_metadata_size {
            report.dropped += 1;
            continue;
        }

        used += cost;
        client_labels += 1;
        labels.insert(key, value);
    }

    (labels, report)
}

fn merge_tiers(
    service: &Labels,
    stream: &Labels,
    batch: &Labels,
    entry: &Labels,
) -> BTreeMap<String, (String, Tier)> {
    let mut merged: BTreeMap<String, (String, Tier)> = entry
        .iter()
        .map(|(key, value)| (key.clone(), (value.clone(), Tier::Entry)))
        .collect();

    overlay(&mut merged, batch, Tier::Batch);
    overlay(&mut merged, stream, Tier::Stream);
    overlay(&mut merged, service, Tier::Service);

    merged
}

fn overlay(merged: &mut BTreeMap<String, (String, Tier)>, labels: &Labels, tier: Tier) {
    for (key, value) in labels {
        insert_shadowing(
            merged,
            key,
            (value.clone(), tier),
            tier.shadow_prefix(),
            |a, b| a.0 == b.0,
        );
    }
}

/// Writes labels the service owns over a label map. Values they displace are kept under `_opt_`
/// shadow keys, the same way stream labels displace lower tiers. A map that went through
/// [`sanitize_labels`] with the same service labels is left unchanged.
pub fn apply_reserved_labels(labels: &mut Labels, reserved: &Labels) {
    for (key, value) in reserved {
        insert_shadowing(labels, key, value.clone(), STREAM_SHADOW_PREFIX, |a, b| a == b);
    }
}

fn insert_shadowing<V>(
    map: &mut BTreeMap<String, V>,
    key: &str,
    value: V,
    shadow_prefix: &str,
    same_value: impl Fn(&V, &V) -> bool,
) {
    let Some(previous) = map.insert(key.to_string(), value) else {
        return;
    };

    if map.get(key).is_some_and(|current| same_value(current, &previous)) {
        return;
    }

    let shadow_key = free_shadow_key(map, shadow_prefix, key);
    map.insert(shadow_key, previous);
}

/// The first `<prefix>...<prefix><key>` not yet present in `map`.
pub fn free_shadow_key<V>(map: &BTreeMap<String, V>, shadow_prefix: &str, key: &str) -> String {
    let mut shadow_key = format!("{shadow_prefix}{key}");
    while map.contains_key(&shadow_key) {
        shadow_key.insert_str(0, shadow_prefix);
    }
    shadow_key
}

/// Rewrites a label key into Loki's `[a-zA-Z_][a-zA-Z0-9_]*` alphabet: separators become `_`,
/// anything else outside the alphabet is removed. Returns `None` when nothing is left.
pub fn strict_label_key(key: &str) -> Option<String> {
    let mut strict: String = key
        .chars()
        .filter_map(|c| match c {
            '_' | '-' | '+' | '*' | '=' => Some('_'),
            c if c.is_ascii_alphanumeric() => Some(c),
            _ => None,
        })
        .collect();

    if strict.is_empty() {
        return None;
    }
    if strict.starts_with(|c: char| c.is_ascii_digit()) {
        strict.insert(0, '_');
    }
    Some(strict)
}

/// Replaces backslashes with `/` and every non-printable character with `?`.
pub fn strip(val: &str) -> String {
    val.chars()
        .map(|c| match c {
            '\\' => '/',
            c if is_printable(c) => c,
            _ => '?',
        })
        .collect()
}

fn is_printable(c: char) -> bool {
    if c == ' ' {
        return true;
    }
    if c.is_control() || c.is_whitespace() {
        return false;
    }
    // zero-width and bidi formatting characters
    !matches!(
        c,
        '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{206F}'
            | '\u{FEFF}'
            | '\u{FFF9}'..='\u{FFFB}'
    )
}

/// Cuts `val` down to `max_chars` characters and appends `marker` when it was longer.
pub fn truncate<'a>(val: &'a str, max_chars: usize, marker: &str) -> (Cow<'a, str>, bool) {
    if max_chars == 0 {
        return (Cow::Borrowed(val), false);
    }

    match val.char_indices().nth(max_chars) {
        None => (Cow::Borrowed(val), false),
        Some((cut, _)) => {
            let mut truncated = String::with_capacity(cut + marker.len());
            truncated.push_str(&val[..cut]);
            truncated.push_str(marker);
            (Cow::Owned(truncated), true)
        }
    }
}

/// Clamps a log message to `max_chars` characters.
pub fn clamp_message(message: &str, max_chars: usize) -> (Cow<'_, str>, bool) {
    truncate(message, max_chars, MESSAGE_TRUNCATION_MARKER)
}
