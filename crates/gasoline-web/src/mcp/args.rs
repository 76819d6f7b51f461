//! Argument extraction for tool calls. Unknown fields are ignored; numbers
//! are accepted as JSON numbers or numeric strings.

use gasoline_types::lenient::{float_from_value, int_from_value};
use serde_json::{Map as JsonMap, Value as JsonValue};

use super::errors::{ErrorCode, ToolError};

pub type Args = JsonMap<String, JsonValue>;

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 1000;

/// Resolves the mode selector (`what`, `action`, ...) against a sorted table.
pub fn select_mode<'a>(
    args: &Args,
    keys: &[&str],
    modes: &[&'a str],
    tool: &str,
) -> Result<&'a str, ToolError> {
    let hint = format!("Valid values: {}", modes.join(", "));
    let primary = keys.first().copied().unwrap_or("what");
    let raw = keys
        .iter()
        .find_map(|key| args.get(*key).and_then(JsonValue::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let Some(raw) = raw else {
        return Err(ToolError::missing_param(
            primary,
            format!("Add the '{primary}' parameter to the {tool} call and try again"),
        )
        .with_hint(hint));
    };
    modes.iter().copied().find(|m| *m == raw).ok_or_else(|| {
        ToolError::new(
            ErrorCode::UnknownMode,
            format!("Unknown {tool} mode: {raw}"),
            format!("Use one of the valid '{primary}' values"),
        )
        .with_param(primary)
        .with_hint(hint)
    })
}

pub fn optional_string(args: &Args, field: &str) -> Result<Option<String>, ToolError> {
    match args.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => {
            let s = s.trim();
            Ok((!s.is_empty()).then(|| s.to_string()))
        }
        Some(_) => Err(ToolError::invalid_param(
            field,
            format!("`{field}` must be a string"),
            format!("Pass '{field}' as a string"),
        )),
    }
}

pub fn required_string(args: &Args, field: &str, retry: &str) -> Result<String, ToolError> {
    optional_string(args, field)?.ok_or_else(|| ToolError::missing_param(field, retry))
}

pub fn optional_i64(args: &Args, field: &str) -> Result<Option<i64>, ToolError> {
    match args.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => int_from_value(value).map(Some).ok_or_else(|| {
            ToolError::invalid_param(
                field,
                format!("`{field}` must be an integer"),
                format!("Pass '{field}' as an integer"),
            )
        }),
    }
}

pub fn optional_f64(args: &Args, field: &str) -> Result<Option<f64>, ToolError> {
    match args.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => float_from_value(value).map(Some).ok_or_else(|| {
            ToolError::invalid_param(
                field,
                format!("`{field}` must be a number"),
                format!("Pass '{field}' as a number"),
            )
        }),
    }
}

pub fn optional_bool(args: &Args, field: &str) -> Result<Option<bool>, ToolError> {
    match args.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ToolError::invalid_param(
            field,
            format!("`{field}` must be a boolean"),
            format!("Pass '{field}' as true or false"),
        )),
    }
}

pub fn optional_string_list(args: &Args, field: &str) -> Result<Option<Vec<String>>, ToolError> {
    let Some(raw) = args.get(field) else {
        return Ok(None);
    };
    let invalid = |msg: String| {
        ToolError::invalid_param(field, msg, format!("Pass '{field}' as an array of strings"))
    };
    let values = raw
        .as_array()
        .ok_or_else(|| invalid(format!("`{field}` must be an array of strings")))?;
    let mut out = Vec::with_capacity(values.len());
    for (index, value) in values.iter().enumerate() {
        let text = value
            .as_str()
            .ok_or_else(|| invalid(format!("`{field}[{index}]` must be a string")))?;
        out.push(text.trim().to_string());
    }
    Ok(Some(out))
}

/// `limit` with the read-path defaults: absent or non-positive means 100,
/// anything above 1000 is capped.
pub fn limit(args: &Args) -> Result<usize, ToolError> {
    Ok(clamp_limit(optional_i64(args, "limit")?))
}

pub fn clamp_limit(raw: Option<i64>) -> usize {
    match raw {
        Some(n) if n > 0 => (n as usize).min(MAX_LIMIT),
        _ => DEFAULT_LIMIT,
    }
}

/// Clamps to `[min, max]`; zero or absent means `default`.
pub fn clamp_or_default(raw: Option<i64>, default: i64, min: i64, max: i64) -> i64 {
    match raw {
        None | Some(0) => default,
        Some(v) => v.clamp(min, max),
    }
}
