//! Parsing for duration values: CLI flags ("250ms", "30s", "5m", "2h") and
//! scenario think pauses, which may also be bare numbers of seconds.

use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;

use crate::{VolleyError, VolleyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolleyDuration(pub Duration);

impl FromStr for VolleyDuration {
    type Err = VolleyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(Self)
    }
}

pub fn parse_duration(input: &str) -> VolleyResult<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(VolleyError::InvalidArgument("empty duration".to_string()));
    }

    let (num_part, unit_part) = split_num_unit(s)?;
    let value: u64 = num_part.parse().map_err(|_| {
        VolleyError::InvalidArgument(format!(
            "invalid duration number: {num_part} (from {input:?})"
        ))
    })?;

    let dur = match unit_part {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        "h" => Duration::from_secs(value.saturating_mul(60 * 60)),
        _ => {
            return Err(VolleyError::InvalidArgument(format!(
                "invalid duration unit {unit_part:?} (expected ms|s|m|h)"
            )));
        }
    };

    Ok(dur)
}

/// Think pauses accept either a duration string or a number of seconds.
pub fn parse_think(value: &Value) -> VolleyResult<Duration> {
    match value {
        Value::String(s) => parse_duration(s),
        Value::Number(n) => {
            let secs = n.as_f64().unwrap_or(-1.0);
            if !secs.is_finite() || secs < 0.0 {
                return Err(VolleyError::InvalidArgument(format!(
                    "invalid think value: {n}"
                )));
            }
            Ok(Duration::from_secs_f64(secs))
        }
        other => Err(VolleyError::InvalidArgument(format!(
            "invalid think value: {other} (expected a duration string or seconds)"
        ))),
    }
}

fn split_num_unit(s: &str) -> VolleyResult<(&str, &str)> {
    let mut idx = 0usize;
    for (i, ch) in s.char_indices() {
        if ch.is_ascii_digit() {
            idx = i + ch.len_utf8();
            continue;
        }
        idx = i;
        break;
    }

    if idx == 0 {
        return Err(VolleyError::InvalidArgument(format!(
            "invalid duration {s:?} (missing number)"
        )));
    }

    if idx >= s.len() {
        return Err(VolleyError::InvalidArgument(format!(
            "invalid duration {s:?} (missing unit; expected ms|s|m|h)"
        )));
    }

    Ok((&s[..idx], &s[idx..]))
}
