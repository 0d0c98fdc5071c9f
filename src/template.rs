//! `{{ .vars.id }}` placeholders in endpoint URLs.
//!
//! A placeholder is a dotted path (leading dot optional) with optional `[n]`
//! indexes, resolved against the request context. Missing and null values
//! render as the empty string; strings render raw, other values as JSON.

use serde_json::Value;

use crate::errors::TemplateError;

#[derive(Debug, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_segments(expression: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut buffer = String::new();
    let mut chars = expression.char_indices().peekable();
    while let Some((pos, ch)) = chars.next() {
        match ch {
            '.' => {
                if !buffer.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut buffer)));
                }
            }
            '[' => {
                if !buffer.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut buffer)));
                }
                let rest = &expression[pos + 1..];
                let close = rest
                    .find(']')
                    .ok_or_else(|| "unmatched '[' in placeholder".to_string())?;
                let token = rest[..close].trim();
                if token.is_empty() {
                    return Err("empty index in placeholder".to_string());
                }
                match token.parse::<usize>() {
                    Ok(index) => segments.push(Segment::Index(index)),
                    Err(_) => segments.push(Segment::Key(token.trim_matches('"').to_string())),
                }
                // skip past the closing bracket
                while chars.peek().is_some_and(|(next, _)| *next <= pos + 1 + close) {
                    chars.next();
                }
            }
            c if c.is_whitespace() => return Err(format!("unexpected whitespace in {expression:?}")),
            c => buffer.push(c),
        }
    }
    if !buffer.is_empty() {
        segments.push(Segment::Key(buffer));
    }
    Ok(segments)
}

fn resolve<'a>(root: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key)?,
            (Segment::Index(idx), Value::Array(items)) => items.get(*idx)?,
            _ => return None,
        };
    }
    Some(current)
}

pub fn render(template: &str, data: &Value) -> Result<String, TemplateError> {
    let fail = |message: String| TemplateError {
        template: template.to_string(),
        message,
    };

    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        output.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| fail("unmatched '{{'".to_string()))?;
        let token = after[..close].trim();
        if token.is_empty() {
            return Err(fail("empty placeholder".to_string()));
        }
        let segments = parse_segments(token).map_err(fail)?;
        match resolve(data, &segments) {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => output.push_str(text),
            Some(other) => output.push_str(&other.to_string()),
        }
        rest = &after[close + 2..];
    }
    output.push_str(rest);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_nested_values() {
        let data = json!({ "vars": { "id": 42, "org": "acme", "tags": ["a", "b"] } });
        assert_eq!(
            render("https://api/{{ .vars.org }}/items/{{.vars.id}}?t={{ vars.tags[1] }}", &data).unwrap(),
            "https://api/acme/items/42?t=b"
        );
    }

    #[test]
    fn missing_values_render_empty() {
        let data = json!({ "vars": { "gone": null } });
        assert_eq!(render("/x/{{ .vars.gone }}{{ .vars.nope }}", &data).unwrap(), "/x/");
    }

    #[test]
    fn malformed_placeholders_fail() {
        let data = json!({});
        assert!(render("/x/{{ .vars.id", &data).is_err());
        assert!(render("/x/{{ }}", &data).is_err());
        assert!(render("/x/{{ .vars[ }}", &data).is_err());
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(render("https://example.com/a", &json!({})).unwrap(), "https://example.com/a");
    }
}
