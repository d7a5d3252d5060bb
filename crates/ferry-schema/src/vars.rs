//! Effective variable resolution for module instances.
//!
//! A module version ships default variables; a project pins the module and may
//! override any of them. The effective set is the defaults overlaid key-by-key
//! by the overrides. Values keep their JSON type; nothing is validated here.

use crate::SchemaError;
use serde_json::Value;
use std::collections::BTreeMap;

/// Flat variable map, ordered by key for deterministic output.
pub type VarMap = BTreeMap<String, Value>;

/// Convert an arbitrary JSON value into a [`VarMap`].
///
/// `null` is accepted as "no variables"; any other non-object value is a
/// configuration error.
pub fn parse_variables(value: &Value) -> Result<VarMap, SchemaError> {
    match value {
        Value::Null => Ok(VarMap::new()),
        Value::Object(map) => Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        other => Err(SchemaError::Configuration(format!(
            "variables must be a JSON object, got {}",
            json_kind(other)
        ))),
    }
}

/// Parse a JSON document into a [`VarMap`].
pub fn parse_variables_str(input: &str) -> Result<VarMap, SchemaError> {
    if input.trim().is_empty() {
        return Ok(VarMap::new());
    }
    let value: Value = serde_json::from_str(input)
        .map_err(|e| SchemaError::Configuration(format!("malformed variables: {e}")))?;
    parse_variables(&value)
}

/// Overlay `overrides` on top of `defaults`. Override wins for shared keys;
/// keys present only in `overrides` are added.
pub fn resolve_variables(defaults: &VarMap, overrides: &VarMap) -> VarMap {
    let mut effective = defaults.clone();
    for (key, value) in overrides {
        effective.insert(key.clone(), value.clone());
    }
    effective
}

/// Apply [`resolve_variables`] across several layers, lowest precedence first.
pub fn layer_variables<'a>(layers: impl IntoIterator<Item = &'a VarMap>) -> VarMap {
    layers
        .into_iter()
        .fold(VarMap::new(), |acc, layer| resolve_variables(&acc, layer))
}

/// Render a variable value for textual substitution.
pub fn var_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
