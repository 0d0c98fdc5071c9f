use std::cmp::Ordering;

use serde_json::{Map, Value};

use super::eval::{is_true, match_object, stringify, values_equal, Callable, Evaluator, Val};
use crate::value::number_value;

const BUILTINS: &[&str] = &[
    "count",
    "sum",
    "max",
    "min",
    "average",
    "string",
    "number",
    "boolean",
    "not",
    "exists",
    "keys",
    "lookup",
    "length",
    "uppercase",
    "lowercase",
    "trim",
    "substring",
    "contains",
    "split",
    "join",
    "match",
    "replace",
    "filter",
    "map",
    "append",
    "distinct",
    "reverse",
    "sort",
    "merge",
    "type",
];

// functions that read the context item when called without arguments
const CONTEXT_DEFAULT: &[&str] = &["string", "number", "length", "uppercase", "lowercase", "trim"];

pub(crate) fn builtin(name: &str) -> Option<&'static str> {
    BUILTINS.iter().copied().find(|candidate| *candidate == name)
}

fn arg<'a>(args: &[Val<'a>], index: usize) -> Val<'a> {
    args.get(index).cloned().unwrap_or(Val::Undefined)
}

fn json<'a>(value: Value) -> Result<Val<'a>, String> {
    Ok(Val::Json(value))
}

fn number<'a>(num: f64, name: &str) -> Result<Val<'a>, String> {
    number_value(num)
        .map(Val::Json)
        .ok_or_else(|| format!("${name}: result is not a finite number"))
}

/// Undefined stays undefined, arrays are returned as is, anything else is
/// wrapped into a single element array.
fn sequence(value: Val<'_>, name: &str) -> Result<Option<Vec<Value>>, String> {
    match value {
        Val::Undefined => Ok(None),
        Val::Json(Value::Array(items)) => Ok(Some(items)),
        Val::Json(single) => Ok(Some(vec![single])),
        Val::Func(_) => Err(format!("${name}: argument must not be a function")),
    }
}

fn numbers(value: Val<'_>, name: &str) -> Result<Option<Vec<f64>>, String> {
    let Some(items) = sequence(value, name)? else {
        return Ok(None);
    };
    items
        .iter()
        .map(|item| {
            item.as_f64()
                .ok_or_else(|| format!("${name}: expected an array of numbers"))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn string_arg(value: Val<'_>, name: &str) -> Result<Option<String>, String> {
    match value {
        Val::Undefined => Ok(None),
        Val::Json(Value::String(text)) => Ok(Some(text)),
        _ => Err(format!("${name}: argument must be a string")),
    }
}

fn int_arg(value: Val<'_>, name: &str) -> Result<Option<i64>, String> {
    match value {
        Val::Undefined => Ok(None),
        Val::Json(Value::Number(num)) => Ok(num.as_f64().map(|f| f.floor() as i64)),
        _ => Err(format!("${name}: argument must be a number")),
    }
}

fn function_arg<'a>(value: Val<'a>, name: &str) -> Result<Callable<'a>, String> {
    match value {
        Val::Func(callable) => Ok(callable),
        _ => Err(format!("${name}: argument must be a function")),
    }
}

pub(crate) fn call<'a>(
    evaluator: &Evaluator<'a>,
    name: &str,
    mut args: Vec<Val<'a>>,
    ctx: &Value,
) -> Result<Val<'a>, String> {
    if args.is_empty() && CONTEXT_DEFAULT.contains(&name) {
        args.push(Val::Json(ctx.clone()));
    }

    match name {
        "count" => {
            let count = sequence(arg(&args, 0), name)?.map_or(0, |items| items.len());
            json(Value::from(count))
        }
        "sum" => {
            let total: f64 = numbers(arg(&args, 0), name)?.unwrap_or_default().iter().sum();
            number(total, name)
        }
        "max" | "min" | "average" => {
            let Some(values) = numbers(arg(&args, 0), name)? else {
                return Ok(Val::Undefined);
            };
            if values.is_empty() {
                return Ok(Val::Undefined);
            }
            let result = match name {
                "max" => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                "min" => values.iter().copied().fold(f64::INFINITY, f64::min),
                _ => values.iter().sum::<f64>() / values.len() as f64,
            };
            number(result, name)
        }
        "string" => match arg(&args, 0) {
            Val::Undefined => Ok(Val::Undefined),
            other => json(Value::String(stringify(&other)?)),
        },
        "number" => match arg(&args, 0) {
            Val::Undefined => Ok(Val::Undefined),
            Val::Json(Value::Number(num)) => json(Value::Number(num)),
            Val::Json(Value::Bool(flag)) => json(Value::from(if flag { 1 } else { 0 })),
            Val::Json(Value::String(text)) => {
                let parsed = text
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| format!("$number: cannot convert {text:?} to a number"))?;
                number(parsed, name)
            }
            _ => Err("$number: argument cannot be converted to a number".to_string()),
        },
        "boolean" => match arg(&args, 0) {
            Val::Undefined => Ok(Val::Undefined),
            other => json(Value::Bool(is_true(&other))),
        },
        "not" => match arg(&args, 0) {
            Val::Undefined => Ok(Val::Undefined),
            other => json(Value::Bool(!is_true(&other))),
        },
        "exists" => json(Value::Bool(!matches!(arg(&args, 0), Val::Undefined))),
        "keys" => {
            let mut keys: Vec<Value> = Vec::new();
            let mut collect = |map: &Map<String, Value>| {
                for key in map.keys() {
                    let key = Value::String(key.clone());
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            };
            match arg(&args, 0) {
                Val::Json(Value::Object(map)) => collect(&map),
                Val::Json(Value::Array(items)) => {
                    for item in &items {
                        if let Value::Object(map) = item {
                            collect(map);
                        }
                    }
                }
                _ => return Ok(Val::Undefined),
            }
            if keys.is_empty() {
                Ok(Val::Undefined)
            } else {
                json(Value::Array(keys))
            }
        }
        "lookup" => {
            let key = string_arg(arg(&args, 1), name)?.unwrap_or_default();
            match arg(&args, 0) {
                Val::Json(Value::Object(map)) => {
                    Ok(map.get(&key).cloned().map(Val::Json).unwrap_or(Val::Undefined))
                }
                Val::Json(Value::Array(items)) => {
                    let found: Vec<Value> = items
                        .iter()
                        .filter_map(|item| item.get(&key).cloned())
                        .collect();
                    if found.is_empty() {
                        Ok(Val::Undefined)
                    } else {
                        json(Value::Array(found))
                    }
                }
                _ => Ok(Val::Undefined),
            }
        }
        "length" => match string_arg(arg(&args, 0), name)? {
            Some(text) => json(Value::from(text.chars().count())),
            None => Ok(Val::Undefined),
        },
        "uppercase" | "lowercase" | "trim" => {
            let Some(text) = string_arg(arg(&args, 0), name)? else {
                return Ok(Val::Undefined);
            };
            let result = match name {
                "uppercase" => text.to_uppercase(),
                "lowercase" => text.to_lowercase(),
                _ => text.split_whitespace().collect::<Vec<_>>().join(" "),
            };
            json(Value::String(result))
        }
        "substring" => {
            let Some(text) = string_arg(arg(&args, 0), name)? else {
                return Ok(Val::Undefined);
            };
            let chars: Vec<char> = text.chars().collect();
            let len = chars.len() as i64;
            let start = int_arg(arg(&args, 1), name)?.unwrap_or(0);
            let start = if start < 0 { len.saturating_add(start).max(0) } else { start.min(len) };
            let end = match int_arg(arg(&args, 2), name)? {
                Some(count) => start.saturating_add(count.max(0)).min(len),
                None => len,
            };
            let slice: String = chars[start as usize..end as usize].iter().collect();
            json(Value::String(slice))
        }
        "contains" => {
            let Some(text) = string_arg(arg(&args, 0), name)? else {
                return Ok(Val::Undefined);
            };
            let found = match arg(&args, 1) {
                Val::Json(Value::String(needle)) => text.contains(&needle),
                Val::Func(Callable::Regex(re)) => re.is_match(&text),
                _ => return Err("$contains: pattern must be a string or regex".to_string()),
            };
            json(Value::Bool(found))
        }
        "split" => {
            let Some(text) = string_arg(arg(&args, 0), name)? else {
                return Ok(Val::Undefined);
            };
            let mut parts: Vec<Value> = match arg(&args, 1) {
                Val::Json(Value::String(sep)) if sep.is_empty() => {
                    text.chars().map(|c| Value::String(c.to_string())).collect()
                }
                Val::Json(Value::String(sep)) => text
                    .split(sep.as_str())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
                Val::Func(Callable::Regex(re)) => re
                    .split(&text)
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
                _ => return Err("$split: separator must be a string or regex".to_string()),
            };
            if let Some(limit) = int_arg(arg(&args, 2), name)? {
                parts.truncate(limit.max(0) as usize);
            }
            json(Value::Array(parts))
        }
        "join" => {
            let Some(items) = sequence(arg(&args, 0), name)? else {
                return Ok(Val::Undefined);
            };
            let separator = string_arg(arg(&args, 1), name)?.unwrap_or_default();
            let parts = items
                .into_iter()
                .map(|item| match item {
                    Value::String(text) => Ok(text),
                    _ => Err("$join: expected an array of strings".to_string()),
                })
                .collect::<Result<Vec<_>, _>>()?;
            json(Value::String(parts.join(&separator)))
        }
        "match" => {
            let Some(text) = string_arg(arg(&args, 0), name)? else {
                return Ok(Val::Undefined);
            };
            let Val::Func(Callable::Regex(re)) = arg(&args, 1) else {
                return Err("$match: second argument must be a regex".to_string());
            };
            let limit = int_arg(arg(&args, 2), name)?.map(|l| l.max(0) as usize);
            let matches: Vec<Value> = re
                .captures_iter(&text)
                .take(limit.unwrap_or(usize::MAX))
                .map(|caps| match_object(&caps))
                .collect();
            json(Value::Array(matches))
        }
        "replace" => {
            let Some(text) = string_arg(arg(&args, 0), name)? else {
                return Ok(Val::Undefined);
            };
            let replacement = string_arg(arg(&args, 2), name)?
                .ok_or_else(|| "$replace: replacement must be a string".to_string())?;
            let limit = int_arg(arg(&args, 3), name)?.map(|l| l.max(0) as usize);
            let result = match arg(&args, 1) {
                Val::Json(Value::String(pattern)) if !pattern.is_empty() => match limit {
                    Some(limit) => text.replacen(&pattern, &replacement, limit),
                    None => text.replace(&pattern, &replacement),
                },
                Val::Func(Callable::Regex(re)) => re
                    .replacen(&text, limit.unwrap_or(0), replacement.as_str())
                    .into_owned(),
                _ => return Err("$replace: pattern must be a non-empty string or regex".to_string()),
            };
            json(Value::String(result))
        }
        "filter" | "map" => {
            let Some(items) = sequence(arg(&args, 0), name)? else {
                return Ok(Val::Undefined);
            };
            let callable = function_arg(arg(&args, 1), name)?;
            let whole = Value::Array(items.clone());
            let mut out = Vec::new();
            for (index, item) in items.into_iter().enumerate() {
                let call_args = vec![
                    Val::Json(item.clone()),
                    Val::Json(Value::from(index)),
                    Val::Json(whole.clone()),
                ];
                let result = evaluator.apply(&callable, call_args, ctx)?;
                if name == "filter" {
                    if is_true(&result) {
                        out.push(item);
                    }
                } else {
                    match result {
                        Val::Undefined => {}
                        Val::Json(value) => out.push(value),
                        Val::Func(_) => return Err("$map: function must not return a function".to_string()),
                    }
                }
            }
            if out.is_empty() {
                Ok(Val::Undefined)
            } else {
                json(Value::Array(out))
            }
        }
        "append" => {
            let first = sequence(arg(&args, 0), name)?;
            let second = sequence(arg(&args, 1), name)?;
            match (first, second) {
                (None, None) => Ok(Val::Undefined),
                (Some(items), None) | (None, Some(items)) => json(Value::Array(items)),
                (Some(mut items), Some(more)) => {
                    items.extend(more);
                    json(Value::Array(items))
                }
            }
        }
        "distinct" => {
            let Some(items) = sequence(arg(&args, 0), name)? else {
                return Ok(Val::Undefined);
            };
            let mut out: Vec<Value> = Vec::new();
            for item in items {
                if !out.iter().any(|seen| values_equal(seen, &item)) {
                    out.push(item);
                }
            }
            json(Value::Array(out))
        }
        "reverse" => {
            let Some(mut items) = sequence(arg(&args, 0), name)? else {
                return Ok(Val::Undefined);
            };
            items.reverse();
            json(Value::Array(items))
        }
        "sort" => {
            let Some(items) = sequence(arg(&args, 0), name)? else {
                return Ok(Val::Undefined);
            };
            let sorted = match arg(&args, 1) {
                Val::Undefined => sort_natural(items)?,
                other => sort_with(evaluator, function_arg(other, name)?, items, ctx)?,
            };
            json(Value::Array(sorted))
        }
        "merge" => {
            let Some(items) = sequence(arg(&args, 0), name)? else {
                return Ok(Val::Undefined);
            };
            let mut merged = Map::new();
            for item in items {
                match item {
                    Value::Object(map) => merged.extend(map),
                    _ => return Err("$merge: expected an array of objects".to_string()),
                }
            }
            json(Value::Object(merged))
        }
        "type" => {
            let kind = match arg(&args, 0) {
                Val::Undefined => return Ok(Val::Undefined),
                Val::Func(_) => "function",
                Val::Json(value) => crate::value::kind_name(&value),
            };
            json(Value::String(kind.to_string()))
        }
        other => Err(format!("unknown function ${other}")),
    }
}

fn sort_natural(mut items: Vec<Value>) -> Result<Vec<Value>, String> {
    if items.iter().all(Value::is_number) {
        items.sort_by(|a, b| {
            a.as_f64()
                .unwrap_or(0.0)
                .partial_cmp(&b.as_f64().unwrap_or(0.0))
                .unwrap_or(Ordering::Equal)
        });
    } else if items.iter().all(Value::is_string) {
        items.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
    } else {
        return Err("$sort: mixed or complex values need a comparator function".to_string());
    }
    Ok(items)
}

fn sort_with<'a>(
    evaluator: &Evaluator<'a>,
    callable: Callable<'a>,
    items: Vec<Value>,
    ctx: &Value,
) -> Result<Vec<Value>, String> {
    let greater = |a: &Value, b: &Value| -> Result<bool, String> {
        let result = evaluator.apply(&callable, vec![Val::Json(a.clone()), Val::Json(b.clone())], ctx)?;
        Ok(is_true(&result))
    };

    // insertion sort: the comparator may fail, and it only needs to answer "a after b"
    let mut sorted: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        let mut position = sorted.len();
        while position > 0 && greater(&sorted[position - 1], &item)? {
            position -= 1;
        }
        sorted.insert(position, item);
    }
    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::super::eval::first_match;
    use super::*;

    #[test]
    fn knows_its_builtins() {
        assert_eq!(builtin("count"), Some("count"));
        assert_eq!(builtin("eval"), None);
    }

    #[test]
    fn first_match_reports_groups() {
        let re = regex::Regex::new(r"(\w+)-api").unwrap();
        match first_match(&re, "test-3-api") {
            Val::Json(value) => {
                assert_eq!(value["match"], "3-api");
                assert_eq!(value["groups"][0], "3");
            }
            _ => panic!("expected a match"),
        }
    }
}
