//! `${NAME}` placeholder substitution over manifest text and YAML trees.
//!
//! Supported forms: `$NAME`, `${NAME}`, `${NAME:-default}`, `${NAME-default}`,
//! `${NAME:?message}`, `${NAME?message}`, `${NAME:+alt}`, `${NAME+alt}`, and
//! `$$` as an escaped literal dollar. The escape is kept as `$$` in the output
//! so the emitted manifest still reads as a literal dollar to the runtime that
//! interpolates it again. Defaults and alternates are interpolated
//! recursively. A placeholder that cannot be resolved is emitted verbatim and
//! reported to the caller; it never aborts substitution.

use crate::vars::{var_to_string, VarMap};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::fmt;

/// A placeholder left in the document because no value and no default exist.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnresolvedVar {
    pub name: String,
    /// Dotted path of the value containing the placeholder, e.g. `services.web.image`.
    pub location: String,
}

impl fmt::Display for UnresolvedVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}}} at {}", self.name, self.location)
    }
}

/// Result of interpolating a single string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpolated {
    pub text: String,
    pub unresolved: Vec<String>,
}

pub fn interpolate_str(input: &str, vars: &VarMap) -> Interpolated {
    let mut out = String::with_capacity(input.len());
    let mut unresolved = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    let mut literal_start = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        out.push_str(&input[literal_start..i]);
        match bytes.get(i + 1) {
            Some(b'$') => {
                out.push_str("$$");
                i += 2;
            }
            Some(b'{') => {
                if let Some(end) = find_closing(bytes, i + 2) {
                    let body = &input[i + 2..end];
                    let raw = &input[i..=end];
                    expand_braced(body, raw, vars, &mut out, &mut unresolved);
                    i = end + 1;
                } else {
                    out.push_str(&input[i..]);
                    i = bytes.len();
                }
            }
            Some(c) if c.is_ascii_alphabetic() || *c == b'_' => {
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && is_name_byte(bytes[j]) {
                    j += 1;
                }
                let name = &input[start..j];
                match vars.get(name) {
                    Some(value) => out.push_str(&var_to_string(value)),
                    None => {
                        out.push_str(&input[i..j]);
                        unresolved.push(name.to_owned());
                    }
                }
                i = j;
            }
            _ => {
                out.push('$');
                i += 1;
            }
        }
        literal_start = i;
    }
    out.push_str(&input[literal_start..]);

    Interpolated {
        text: out,
        unresolved,
    }
}

/// Interpolate every string scalar in a YAML tree in place. Mapping keys are
/// not interpolated.
pub fn interpolate_value(
    value: &mut Value,
    vars: &VarMap,
    path: &str,
    unresolved: &mut Vec<UnresolvedVar>,
) {
    match value {
        Value::String(s) => {
            if !s.contains('$') {
                return;
            }
            let result = interpolate_str(s, vars);
            for name in result.unresolved {
                unresolved.push(UnresolvedVar {
                    name,
                    location: path.to_owned(),
                });
            }
            *s = result.text;
        }
        Value::Sequence(seq) => {
            for (idx, item) in seq.iter_mut().enumerate() {
                interpolate_value(item, vars, &format!("{path}[{idx}]"), unresolved);
            }
        }
        Value::Mapping(map) => {
            for (key, item) in map.iter_mut() {
                let child = if path.is_empty() {
                    key_label(key)
                } else {
                    format!("{path}.{}", key_label(key))
                };
                interpolate_value(item, vars, &child, unresolved);
            }
        }
        Value::Tagged(tagged) => interpolate_value(&mut tagged.value, vars, path, unresolved),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

fn key_label(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => "?".to_owned(),
    }
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Find the `}` closing a `${` whose body starts at `start`, honouring nesting.
fn find_closing(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 1usize;
    let mut j = start;
    while j < bytes.len() {
        match bytes[j] {
            b'$' if bytes.get(j + 1) == Some(&b'{') => {
                depth += 1;
                j += 2;
                continue;
            }
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(j);
                }
            }
            _ => {}
        }
        j += 1;
    }
    None
}

fn expand_braced(
    body: &str,
    raw: &str,
    vars: &VarMap,
    out: &mut String,
    unresolved: &mut Vec<String>,
) {
    let name_len = body.bytes().take_while(|b| is_name_byte(*b)).count();
    let (name, op) = body.split_at(name_len);
    if name.is_empty() || name.as_bytes()[0].is_ascii_digit() {
        out.push_str(raw);
        unresolved.push(body.to_owned());
        return;
    }

    let value = vars.get(name).map(var_to_string);
    let is_set = value.is_some();
    let is_non_empty = value.as_deref().is_some_and(|v| !v.is_empty());

    if op.is_empty() {
        match value {
            Some(v) => out.push_str(&v),
            None => {
                out.push_str(raw);
                unresolved.push(name.to_owned());
            }
        }
    } else if let Some(default) = op.strip_prefix(":-") {
        match value {
            Some(v) if is_non_empty => out.push_str(&v),
            _ => nested(default, vars, out, unresolved),
        }
    } else if let Some(default) = op.strip_prefix('-') {
        match value {
            Some(v) => out.push_str(&v),
            None => nested(default, vars, out, unresolved),
        }
    } else if let Some(alt) = op.strip_prefix(":+") {
        if is_non_empty {
            nested(alt, vars, out, unresolved);
        }
    } else if let Some(alt) = op.strip_prefix('+') {
        if is_set {
            nested(alt, vars, out, unresolved);
        }
    } else if op.starts_with(":?") || op.starts_with('?') {
        let required_ok = if op.starts_with(':') {
            is_non_empty
        } else {
            is_set
        };
        match value {
            Some(v) if required_ok => out.push_str(&v),
            _ => {
                out.push_str(raw);
                unresolved.push(name.to_owned());
            }
        }
    } else {
        out.push_str(raw);
        unresolved.push(name.to_owned());
    }
}

fn nested(text: &str, vars: &VarMap, out: &mut String, unresolved: &mut Vec<String>) {
    let result = interpolate_str(text, vars);
    out.push_str(&result.text);
    unresolved.extend(result.unresolved);
}
