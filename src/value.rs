use serde_json::{Map, Number, Value};

/// Variable bound to the results accumulated so far in a pipeline run.
/// Reserved: never taken from user-supplied variable maps.
pub const ROOT_VAR: &str = "root";

/// Result key used when a step declares neither a target nor an endpoint.
pub const DEFAULT_RESULT_KEY: &str = "result";

/// Prefix of the per-step context entries published by `with_context` steps.
pub const CONTEXT_PREFIX: &str = "context_";

/// Zero values never overwrite present values during merges.
pub fn is_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::Number(num) => num.as_f64().map_or(false, |f| f == 0.0),
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(num) => num.as_f64().map_or(false, |f| f != 0.0 && !f.is_nan()),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

/// Boolean reading of a requirement flag: `true`, non-zero numbers and the
/// strings `true`/`yes`/`on`/`1` are truthy; anything else is not.
pub fn as_flag(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(num) => num.as_f64().map_or(false, |f| f != 0.0),
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "on" | "1"
        ),
        _ => false,
    }
}

/// String form of a value: strings verbatim, null empty, the rest as JSON.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Numbers that hold an integral value are stored as integers so that
/// `1.0` and `1` render identically.
pub fn number_value(num: f64) -> Option<Value> {
    if !num.is_finite() {
        return None;
    }
    if num.fract() == 0.0 && num.abs() < 9.007_199_254_740_992e15 {
        return Some(Value::Number(Number::from(num as i64)));
    }
    Number::from_f64(num).map(Value::Number)
}

/// Overlay `overlay` onto `base`, skipping zero values.
pub fn merge_non_zero(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        if !is_zero(value) {
            base.insert(key.clone(), value.clone());
        }
    }
}
