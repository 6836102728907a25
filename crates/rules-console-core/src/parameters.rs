//! Codec for the serialized `customParameters` blob.
//!
//! The mutation engine never looks inside the blob. Readers go through
//! [`parse_custom_parameters`], which recovers to an empty list instead of failing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::RulesError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CustomParameter {
    pub name: String,
    pub value: String,
}

/// Decode a serialized parameter list.
///
/// Accepts the list form `[{"name": .., "value": ..}]` and the mapping form
/// `{"name": value}`. Entries without a string `name` are skipped.
#[must_use]
pub fn parse_custom_parameters(raw: &str) -> Vec<CustomParameter> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let decoded: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "custom parameters are not valid JSON; treating as empty");
            return Vec::new();
        }
    };

    match decoded {
        Value::Array(entries) => entries.iter().filter_map(parameter_from_entry).collect(),
        Value::Object(mapping) => mapping
            .into_iter()
            .map(|(name, value)| CustomParameter { name, value: render_value(&value) })
            .collect(),
        other => {
            warn!(kind = value_kind(&other), "custom parameters are neither a list nor a mapping");
            Vec::new()
        }
    }
}

/// Encode parameters in the list form.
///
/// # Errors
/// Returns [`RulesError::Codec`] when serialization fails.
pub fn serialize_custom_parameters(parameters: &[CustomParameter]) -> Result<String, RulesError> {
    serde_json::to_string(parameters).map_err(|err| RulesError::Codec(err.to_string()))
}

#[must_use]
pub fn has_editable_parameters(raw: &str) -> bool {
    !parse_custom_parameters(raw).is_empty()
}

/// Overlay edited values onto the parameters already present in `raw`.
///
/// Returns `Ok(None)` when the rule has no parameters to edit. Edits naming a parameter
/// that does not exist are ignored.
///
/// # Errors
/// Returns [`RulesError::Codec`] when the edited list cannot be serialized.
pub fn apply_parameter_edits(
    raw: &str,
    edits: &BTreeMap<String, String>,
) -> Result<Option<String>, RulesError> {
    let mut parameters = parse_custom_parameters(raw);
    if parameters.is_empty() {
        return Ok(None);
    }

    for parameter in &mut parameters {
        if let Some(value) = edits.get(&parameter.name) {
            parameter.value.clone_from(value);
        }
    }

    serialize_custom_parameters(&parameters).map(Some)
}

fn parameter_from_entry(entry: &Value) -> Option<CustomParameter> {
    let name = entry.get("name")?.as_str()?;
    Some(CustomParameter {
        name: name.to_string(),
        value: entry.get("value").map(render_value).unwrap_or_default(),
    })
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
