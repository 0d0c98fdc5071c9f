use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::graphql::GraphQLQuery;

/// Declared shape of an endpoint's result. Informational only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    #[default]
    Any,
    Object,
    List,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataKind::Any => "any",
            DataKind::Object => "object",
            DataKind::List => "list",
        })
    }
}

fn is_any(kind: &DataKind) -> bool {
    *kind == DataKind::Any
}

/// A named remote call target with its request defaults and result filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    pub url: String,
    #[serde(default, rename = "body", skip_serializing_if = "Value::is_null")]
    pub request_body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graphql: Option<GraphQLQuery>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub path_params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub headers: Map<String, Value>,
    #[serde(default, rename = "type", skip_serializing_if = "is_any")]
    pub result_type: DataKind,
    #[serde(default, rename = "filters", skip_serializing_if = "Vec::is_empty")]
    pub result_filters: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// HTTP method to use: the declared one upper-cased, else `POST` for
    /// GraphQL endpoints and `GET` for everything else.
    pub fn effective_method(&self) -> String {
        let declared = self.method.trim();
        if !declared.is_empty() {
            declared.to_ascii_uppercase()
        } else if self.graphql.is_some() {
            "POST".to_string()
        } else {
            "GET".to_string()
        }
    }
}
