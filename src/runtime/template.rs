//! Dynamic-value substitution of `{{ name }}` tokens inside nested shapes.

use serde_json::Value;

use crate::VuContext;

/// Substitute every token in `value` against the context's variables. A
/// string that is exactly one token resolves to the raw captured value,
/// preserving its type; embedded tokens render through string formatting.
/// Token-free values pass through unchanged, so substitution is idempotent
/// on anything it has already fully resolved.
pub fn template(value: &Value, ctx: &VuContext) -> Value {
    match value {
        Value::String(s) => template_string(s, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|v| template(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), template(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn template_string(s: &str, ctx: &VuContext) -> Value {
    if let Some(name) = single_token(s.trim()) {
        return ctx
            .vars
            .get(name)
            .cloned()
            .unwrap_or_else(|| Value::String(String::new()));
    }
    if !s.contains("{{") {
        return Value::String(s.to_string());
    }

    let mut out = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            // unterminated token: keep the tail verbatim
            out.push_str(&rest[start..]);
            return Value::String(out);
        };
        let name = after[..end].trim();
        if let Some(found) = ctx.vars.get(name) {
            out.push_str(&render_scalar(found));
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Value::String(out)
}

/// `Some(name)` when the whole string is a single `{{ name }}` token.
fn single_token(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    let name = inner.trim();
    if name.is_empty() || name.contains("{{") || name.contains("}}") {
        return None;
    }
    Some(name)
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
