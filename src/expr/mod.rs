//! Expression evaluation for step queries, foreach selectors and transforms.
//!
//! The pipeline only talks to [`ExpressionEngine`]; [`Jsonata`] is the built-in
//! engine and understands the JSONata subset used by dataset definitions.

mod eval;
mod functions;
mod lexer;
mod parser;

use serde_json::{Map, Value};

use crate::errors::ExpressionError;
use crate::value::to_text;

use parser::{Node, Parser};

pub trait ExpressionEngine: Send + Sync {
    fn compile(&self, source: &str) -> Result<Box<dyn CompiledExpression>, ExpressionError>;
}

pub trait CompiledExpression: Send + Sync {
    /// Evaluate against `data`, with every entry of `vars` bound as `$name`.
    fn evaluate(&self, data: &Value, vars: &Map<String, Value>) -> Result<Value, ExpressionError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Jsonata;

impl ExpressionEngine for Jsonata {
    fn compile(&self, source: &str) -> Result<Box<dyn CompiledExpression>, ExpressionError> {
        let ast = Parser::parse(source).map_err(|message| ExpressionError::compile(source, message))?;
        Ok(Box::new(JsonataExpression {
            source: source.to_string(),
            ast,
        }))
    }
}

struct JsonataExpression {
    source: String,
    ast: Node,
}

impl CompiledExpression for JsonataExpression {
    fn evaluate(&self, data: &Value, vars: &Map<String, Value>) -> Result<Value, ExpressionError> {
        eval::evaluate(&self.ast, data, vars).map_err(|message| ExpressionError::eval(&self.source, message))
    }
}

/// Expression text for a query or transform definition.
///
/// Strings are used verbatim. Mappings become an object constructor whose
/// string values are spliced in unquoted, so `{ids: "items.id"}` reads as
/// `{"ids": items.id}`. Lists concatenate the sources of their members.
pub fn expression_source(definition: &Value) -> String {
    match definition {
        Value::String(text) => text.clone(),
        Value::Object(map) => {
            let fields: Vec<String> = map
                .iter()
                .map(|(key, value)| {
                    let key = Value::String(key.clone()).to_string();
                    let value = match value {
                        Value::String(text) => text.clone(),
                        Value::Object(_) => expression_source(value),
                        other => other.to_string(),
                    };
                    format!("{key}: {value}")
                })
                .collect();
            format!("{{{}}}", fields.join(", "))
        }
        Value::Array(items) => items.iter().map(expression_source).collect(),
        other => to_text(other),
    }
}

/// Apply each transform in order, feeding every result into the next one.
/// All transforms compile before the first one runs; empty ones are skipped.
pub fn apply_expressions(
    engine: &dyn ExpressionEngine,
    data: Value,
    vars: &Map<String, Value>,
    definitions: &[Value],
) -> Result<Value, ExpressionError> {
    let compiled = definitions
        .iter()
        .map(expression_source)
        .filter(|source| !source.trim().is_empty())
        .map(|source| engine.compile(&source))
        .collect::<Result<Vec<_>, _>>()?;

    compiled
        .iter()
        .try_fold(data, |current, expression| expression.evaluate(&current, vars))
}
