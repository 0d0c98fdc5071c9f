use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ExpressionError;
use crate::expr::{expression_source, ExpressionEngine};
use crate::value::{is_zero, kind_name, merge_non_zero, ROOT_VAR};

/// Params, headers and variables in effect at one scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub headers: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
}

impl Context {
    /// Per-key overlay of `other` onto `self`. Zero values from either side
    /// are dropped, so they never overwrite and never reach a request.
    pub fn merge(&self, other: &Context) -> Context {
        let mut merged = Context::default();
        for layer in [self, other] {
            merge_non_zero(&mut merged.params, &layer.params);
            merge_non_zero(&mut merged.headers, &layer.headers);
            merge_non_zero(&mut merged.variables, &layer.variables);
        }
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.headers.is_empty() && self.variables.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facet {
    PathParams,
    Params,
    Headers,
    Variables,
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Facet::PathParams => "path_params",
            Facet::Params => "params",
            Facet::Headers => "headers",
            Facet::Variables => "variables",
        })
    }
}

/// Everything a caller, pipeline or step can say about a query: a context,
/// dynamic (expression-computed) additions to each facet, the `foreach`
/// selector, transforms and the endpoint to call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(flatten)]
    pub context: Context,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub path_params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub foreach: String,
    #[serde(default, rename = "path_params_json", skip_serializing_if = "Value::is_null")]
    pub path_params_query: Value,
    #[serde(default, rename = "params_json", skip_serializing_if = "Value::is_null")]
    pub params_query: Value,
    #[serde(default, rename = "headers_json", skip_serializing_if = "Value::is_null")]
    pub headers_query: Value,
    #[serde(default, rename = "variables_json", skip_serializing_if = "Value::is_null")]
    pub variables_query: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
}

fn overlay_scalar(base: &mut Value, other: &Value) {
    if !is_zero(other) {
        *base = other.clone();
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.params.insert(name.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.headers.insert(name.into(), value.into());
        self
    }

    /// New options where `other` wins every conflict on non-empty values.
    /// Transforms are replaced wholesale when `other` declares any.
    pub fn merge(&self, other: &QueryOptions) -> QueryOptions {
        let mut merged = QueryOptions {
            context: self.context.merge(&other.context),
            ..QueryOptions::default()
        };
        for layer in [self, other] {
            merge_non_zero(&mut merged.path_params, &layer.path_params);
            if !layer.foreach.is_empty() {
                merged.foreach = layer.foreach.clone();
            }
            if !layer.endpoint.is_empty() {
                merged.endpoint = layer.endpoint.clone();
            }
            overlay_scalar(&mut merged.path_params_query, &layer.path_params_query);
            overlay_scalar(&mut merged.params_query, &layer.params_query);
            overlay_scalar(&mut merged.headers_query, &layer.headers_query);
            overlay_scalar(&mut merged.variables_query, &layer.variables_query);
            if !layer.transforms.is_empty() {
                merged.transforms = layer.transforms.clone();
            }
        }
        merged
    }

    /// Merge with optional options; `None` merges with empty options.
    pub fn merge_opt(&self, other: Option<&QueryOptions>) -> QueryOptions {
        match other {
            Some(other) => self.merge(other),
            None => self.merge(&QueryOptions::default()),
        }
    }

    /// Copy of the options with every facet rendered against `data`.
    pub fn render(&self, data: &Value, engine: &dyn ExpressionEngine) -> Result<QueryOptions, ExpressionError> {
        let mut rendered = self.clone();
        rendered.context.variables = self.render_facet(Facet::Variables, data, engine)?;
        rendered.path_params = self.render_facet(Facet::PathParams, data, engine)?;
        rendered.context.params = self.render_facet(Facet::Params, data, engine)?;
        rendered.context.headers = self.render_facet(Facet::Headers, data, engine)?;
        Ok(rendered)
    }

    pub fn render_variables(
        &self,
        data: &Value,
        engine: &dyn ExpressionEngine,
    ) -> Result<Map<String, Value>, ExpressionError> {
        self.render_facet(Facet::Variables, data, engine)
    }

    /// The facet's query result (which must be a mapping) overlaid with its
    /// explicit entries. `root` is never part of the output.
    pub fn render_facet(
        &self,
        facet: Facet,
        data: &Value,
        engine: &dyn ExpressionEngine,
    ) -> Result<Map<String, Value>, ExpressionError> {
        let (explicit, query) = match facet {
            Facet::PathParams => (&self.path_params, &self.path_params_query),
            Facet::Params => (&self.context.params, &self.params_query),
            Facet::Headers => (&self.context.headers, &self.headers_query),
            Facet::Variables => (&self.context.variables, &self.variables_query),
        };

        let mut out = Map::new();
        if !is_zero(query) {
            let source = expression_source(query);
            let compiled = engine.compile(&source)?;
            match compiled.evaluate(data, &self.context.variables)? {
                Value::Object(map) => {
                    out.extend(map.into_iter().filter(|(key, _)| key != ROOT_VAR));
                }
                Value::Null => {}
                other => {
                    return Err(ExpressionError::eval(
                        &source,
                        format!("{facet} query must return a mapping, got {}", kind_name(&other)),
                    ))
                }
            }
        }

        for (key, value) in explicit {
            if key != ROOT_VAR {
                out.insert(key.clone(), value.clone());
            }
        }
        Ok(out)
    }
}
