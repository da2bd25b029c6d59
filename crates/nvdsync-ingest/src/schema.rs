//! Schema validation capability
//!
//! The manager only depends on [`SchemaValidator`]; the rule set is supplied by
//! the embedder. [`NvdSchema`] is a structural check of the fields downstream
//! matchers rely on.

use chrono::NaiveDateTime;
use serde_json::Value;

/// Validates canonical payloads before they are handed to the caller
pub trait SchemaValidator: Send + Sync {
    /// Schema name recorded alongside stored results
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Return every violation found, or `Ok(())` for a valid payload
    fn validate(&self, payload: &Value) -> Result<(), Vec<String>>;
}

/// Structural validator for CVE API 2.0 vulnerability items
#[derive(Debug, Clone, Default)]
pub struct NvdSchema;

impl NvdSchema {
    pub const NAME: &'static str = "nvd";
    pub const VERSION: &'static str = "2.0.0";
}

impl SchemaValidator for NvdSchema {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> &str {
        Self::VERSION
    }

    fn validate(&self, payload: &Value) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let Some(cve) = payload.get("cve").and_then(Value::as_object) else {
            return Err(vec!["cve: expected an object".to_string()]);
        };

        match cve.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => {},
            _ => errors.push("cve.id: expected a non-empty string".to_string()),
        }

        for field in ["published", "lastModified"] {
            match cve.get(field).and_then(Value::as_str) {
                Some(ts) if parse_timestamp(ts) => {},
                Some(ts) => errors.push(format!("cve.{field}: invalid timestamp '{ts}'")),
                None => errors.push(format!("cve.{field}: required")),
            }
        }

        match cve.get("descriptions").and_then(Value::as_array) {
            Some(descriptions) => {
                for (idx, description) in descriptions.iter().enumerate() {
                    let lang = description.get("lang").and_then(Value::as_str);
                    let value = description.get("value").and_then(Value::as_str);
                    if lang.is_none() || value.is_none() {
                        errors.push(format!(
                            "cve.descriptions[{idx}]: expected string 'lang' and 'value'"
                        ));
                    }
                }
            },
            None => errors.push("cve.descriptions: expected an array".to_string()),
        }

        if let Some(metrics) = cve.get("metrics") {
            if !metrics.is_object() {
                errors.push("cve.metrics: expected an object".to_string());
            }
        }

        if let Some(references) = cve.get("references") {
            match references.as_array() {
                Some(refs) => {
                    for (idx, reference) in refs.iter().enumerate() {
                        if reference.get("url").and_then(Value::as_str).is_none() {
                            errors.push(format!("cve.references[{idx}].url: required"));
                        }
                    }
                },
                None => errors.push("cve.references: expected an array".to_string()),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Upstream timestamps look like `2002-01-15T05:00:00.000`, offset optional
fn parse_timestamp(ts: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(ts).is_ok()
        || NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
}
