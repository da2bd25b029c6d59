//! Record normalization
//!
//! Turns a raw `vulnerabilities[]` entry into a [`CanonicalRecord`]. The
//! transformation is pure: the same raw item always yields the same record,
//! and its payload serializes to the same bytes.

use super::models::{CanonicalRecord, RawItem};
use crate::error::{Result, SyncError};
use crate::schema::SchemaValidator;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

#[allow(clippy::expect_used)]
static CVE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^CVE-\d{4}-\d{4,}$").expect("CVE identifier pattern is valid"));

/// Extract and canonicalize the CVE identifier of a raw item
///
/// Identifiers are matched case-insensitively and returned upper-case.
pub fn extract_identifier(raw: &RawItem) -> Result<String> {
    let id = raw
        .get("cve")
        .and_then(|cve| cve.get("id"))
        .and_then(Value::as_str)
        .map(str::trim);

    match id {
        Some(id) if CVE_ID.is_match(id) => Ok(id.to_uppercase()),
        _ => Err(SyncError::malformed(&raw.to_string())),
    }
}

/// Rebuild a JSON value with object keys in sorted order
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect::<Map<String, Value>>(),
            )
        },
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Normalizes raw items and validates them against the injected schema
#[derive(Clone)]
pub struct RecordNormalizer {
    schema: Arc<dyn SchemaValidator>,
}

impl RecordNormalizer {
    pub fn new(schema: Arc<dyn SchemaValidator>) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Arc<dyn SchemaValidator> {
        &self.schema
    }

    /// Produce the canonical record for `raw`, read from `source_url`
    pub fn normalize(&self, raw: RawItem, source_url: &str) -> Result<CanonicalRecord> {
        let identifier = extract_identifier(&raw)?;
        let mut payload = canonicalize(raw);

        // Store the identifier in its canonical casing.
        if let Some(id) = payload.get_mut("cve").and_then(|cve| cve.get_mut("id")) {
            *id = Value::String(identifier.clone());
        }

        self.schema
            .validate(&payload)
            .map_err(|errors| SyncError::SchemaViolation {
                identifier: identifier.clone(),
                errors,
            })?;

        Ok(CanonicalRecord {
            identifier,
            payload,
            source_urls: BTreeSet::from([source_url.to_string()]),
        })
    }
}
