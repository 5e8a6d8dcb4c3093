//! Capture and match evaluation over reply payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use std::collections::BTreeMap;

use crate::{CaptureSpec, MatchSpec, VolleyError, VolleyResult};

/// Replies are wrapped as a generic body payload before extraction, the same
/// envelope shape the HTTP delegate engine sees.
#[derive(Debug, Clone)]
pub struct ReplyEnvelope {
    pub body: String,
}

impl ReplyEnvelope {
    pub fn wrap(payload: &Value) -> VolleyResult<Self> {
        Ok(Self {
            body: serde_json::to_string(payload)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub success: bool,
    pub expected: Value,
    pub got: Value,
    pub expression: String,
}

#[derive(Debug, Clone, Default)]
pub struct CaptureOrMatchResult {
    pub captures: BTreeMap<String, Value>,
    pub matches: BTreeMap<String, MatchOutcome>,
}

/// Evaluate every capture and match expression against the envelope body.
/// Malformed expressions fail with `Extraction`; expressions that simply
/// select nothing yield `null`.
pub fn capture_or_match(
    captures: &[CaptureSpec],
    matches: &[MatchSpec],
    envelope: &ReplyEnvelope,
) -> VolleyResult<CaptureOrMatchResult> {
    let body: Value = serde_json::from_str(&envelope.body)
        .map_err(|err| VolleyError::Extraction(format!("reply body is not valid JSON: {err}")))?;

    let mut result = CaptureOrMatchResult::default();
    for spec in captures {
        let got = eval_path(&spec.json, &body)?;
        result.captures.insert(spec.capture_as.clone(), got);
    }
    for spec in matches {
        let got = eval_path(&spec.json, &body)?;
        result.matches.insert(
            spec.json.clone(),
            MatchOutcome {
                success: got == spec.value,
                expected: spec.value.clone(),
                got,
                expression: spec.json.clone(),
            },
        );
    }
    Ok(result)
}

/// JSONPath-lite: `$` followed by `.name` and `[index]` segments. A numeric
/// `.name` segment indexes arrays, which is how acknowledge expressions like
/// `$[1]._id` address the callback-argument sequence.
fn eval_path(expr: &str, root: &Value) -> VolleyResult<Value> {
    let rest = expr.strip_prefix('$').ok_or_else(|| {
        VolleyError::Extraction(format!("expression must start with '$': {expr:?}"))
    })?;

    let mut current = root.clone();
    let mut remaining = rest;
    while !remaining.is_empty() {
        if let Some(after_dot) = remaining.strip_prefix('.') {
            let end = after_dot
                .find(['.', '['])
                .unwrap_or(after_dot.len());
            let name = &after_dot[..end];
            if name.is_empty() {
                return Err(VolleyError::Extraction(format!(
                    "empty segment in expression {expr:?}"
                )));
            }
            current = select_name(&current, name);
            remaining = &after_dot[end..];
        } else if let Some(after_bracket) = remaining.strip_prefix('[') {
            let Some(end) = after_bracket.find(']') else {
                return Err(VolleyError::Extraction(format!(
                    "unterminated index in expression {expr:?}"
                )));
            };
            let index: usize = after_bracket[..end].trim().parse().map_err(|_| {
                VolleyError::Extraction(format!(
                    "invalid index {:?} in expression {expr:?}",
                    &after_bracket[..end]
                ))
            })?;
            current = select_index(&current, index);
            remaining = &after_bracket[end + 1..];
        } else {
            return Err(VolleyError::Extraction(format!(
                "unexpected character {:?} in expression {expr:?}",
                remaining.chars().next().unwrap_or(' ')
            )));
        }
    }
    Ok(current)
}

fn select_name(value: &Value, name: &str) -> Value {
    match value {
        Value::Object(map) => map.get(name).cloned().unwrap_or(Value::Null),
        Value::Array(items) => match name.parse::<usize>() {
            Ok(index) => items.get(index).cloned().unwrap_or(Value::Null),
            Err(_) => Value::Null,
        },
        _ => Value::Null,
    }
}

fn select_index(value: &Value, index: usize) -> Value {
    match value {
        Value::Array(items) => items.get(index).cloned().unwrap_or(Value::Null),
        Value::Object(map) => map.get(&index.to_string()).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}
