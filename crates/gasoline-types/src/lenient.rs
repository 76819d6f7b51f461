//! Tolerant numeric decoding for fields the extension reports inconsistently
//! (integers, floats with a zero fraction, or numeric strings).

use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;

/// Interprets a JSON value as an integer. Accepts `42`, `42.0`, `"42"` and
/// `" 42 "`; anything else (fractions, non-numeric strings, objects) is `None`.
pub fn int_from_value(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| integral_f64(n.as_f64()?)),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| integral_f64(s.parse::<f64>().ok()?))
        }
        _ => None,
    }
}

fn integral_f64(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

/// Interprets a JSON value as a float, also accepting numeric strings.
pub fn float_from_value(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

pub fn opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(int_from_value))
}

pub fn i64_or_zero<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(opt_i64(deserializer)?.unwrap_or(0))
}

pub fn f64_or_zero<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(float_from_value).unwrap_or(0.0))
}

pub fn opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(float_from_value))
}
