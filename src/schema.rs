use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::context::QueryOptions;
use crate::endpoint::Endpoint;
use crate::errors::{UndefinedEndpointError, UnknownSchemaError};
use crate::pipeline::Pipeline;
use crate::registry::{Registry, RunContext};
use crate::response::{QueryFailure, QueryResponse};

/// A named, queryable unit. Without a pipeline it answers with an empty
/// result named after itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Schema {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Pipeline>,
}

impl Schema {
    pub fn query(&self, ctx: &RunContext, options: Option<&QueryOptions>) -> Result<QueryResponse, QueryFailure> {
        let mut response = match &self.pipeline {
            Some(pipeline) => match pipeline.query(ctx, options) {
                Ok(response) => response,
                Err(mut failure) => {
                    failure.response.query = options.cloned();
                    return Err(failure);
                }
            },
            None => {
                let mut response = QueryResponse::new(None);
                response.endpoint_name = Some(self.name.clone());
                response
            }
        };
        response.query = options.cloned();
        response.complete(None)
    }
}

/// Endpoints and queries declared by one or more dataset files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    #[serde(default)]
    pub endpoints: BTreeMap<String, Endpoint>,
    #[serde(default)]
    pub queries: BTreeMap<String, Schema>,
}

impl DatasetConfig {
    /// Fold `other` in; its entries replace same-named ones.
    pub fn merge(&mut self, other: DatasetConfig) {
        self.endpoints.extend(other.endpoints);
        self.queries.extend(other.queries);
    }

    /// Name every endpoint, query and unnamed pipeline after its key.
    pub fn prepare(&mut self) {
        for (name, endpoint) in &mut self.endpoints {
            endpoint.name = name.clone();
        }
        for (name, schema) in &mut self.queries {
            schema.name = name.clone();
            if let Some(pipeline) = &mut schema.pipeline {
                if pipeline.name.is_empty() {
                    pipeline.name = name.clone();
                }
            }
        }
    }

    /// Every endpoint a step names must be declared.
    pub fn validate(&self) -> Result<()> {
        for (name, schema) in &self.queries {
            let Some(pipeline) = &schema.pipeline else {
                continue;
            };
            for (index, step) in pipeline.steps.iter().enumerate() {
                let Some(query) = &step.query else {
                    continue;
                };
                if !query.endpoint.is_empty() && !self.endpoints.contains_key(&query.endpoint) {
                    return Err(UndefinedEndpointError {
                        query: name.clone(),
                        step: index,
                        endpoint: query.endpoint.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> Registry {
        let mut builder = Registry::builder();
        for (name, endpoint) in &self.endpoints {
            builder.register(name, endpoint.clone());
        }
        builder.build()
    }

    pub fn query_schema(
        &self,
        ctx: &RunContext,
        name: &str,
        options: Option<&QueryOptions>,
    ) -> Result<QueryResponse, QueryFailure> {
        match self.queries.get(name) {
            Some(schema) => schema.query(ctx, options),
            None => {
                let mut response = QueryResponse::new(None);
                response.query = options.cloned();
                Err(response.failed(
                    UnknownSchemaError {
                        name: name.to_string(),
                    }
                    .into(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn dataset(yaml: &str) -> DatasetConfig {
        let mut dataset: DatasetConfig = serde_yaml::from_str(yaml).unwrap();
        dataset.prepare();
        dataset
    }

    #[test]
    fn prepare_assigns_names() {
        let dataset = dataset(
            r#"
endpoints:
  users:
    url: http://api.local/users
queries:
  people:
    pipeline:
      steps:
        - query:
            endpoint: users
"#,
        );
        assert_eq!(dataset.endpoints["users"].name, "users");
        assert_eq!(dataset.queries["people"].name, "people");
        assert_eq!(dataset.queries["people"].pipeline.as_ref().unwrap().name, "people");
        assert!(dataset.validate().is_ok());
        assert_eq!(dataset.registry().names(), vec!["users"]);
    }

    #[test]
    fn undefined_step_endpoints_are_rejected() {
        let dataset = dataset(
            r#"
queries:
  people:
    pipeline:
      steps:
        - transforms: ["$"]
        - query:
            endpoint: ghosts
"#,
        );
        let err = dataset.validate().unwrap_err();
        let undefined = err.downcast_ref::<UndefinedEndpointError>().unwrap();
        assert_eq!(undefined.step, 1);
        assert_eq!(err.to_string(), "query people, step 1: undefined endpoint \"ghosts\"");
    }

    #[test]
    fn later_datasets_win() {
        let mut base = dataset("endpoints: { a: { url: 'http://one' } }");
        base.merge(dataset("endpoints: { a: { url: 'http://two' }, b: { url: 'http://b' } }"));
        assert_eq!(base.endpoints["a"].url, "http://two");
        assert_eq!(base.endpoints.len(), 2);
    }

    #[test]
    fn pass_through_schemas_answer_empty() {
        let dataset = dataset("queries: { placeholder: { summary: nothing yet } }");
        let ctx = dataset.registry().context();
        let options = QueryOptions::new().with_variable("x", 1);
        let response = dataset
            .query_schema(&ctx, "placeholder", Some(&options))
            .unwrap();
        assert_eq!(response.endpoint_name.as_deref(), Some("placeholder"));
        assert_eq!(response.result, Value::Null);
        assert_eq!(response.query, Some(options));
    }

    #[test]
    fn unknown_schemas_fail_with_a_response() {
        let dataset = DatasetConfig::default();
        let ctx = dataset.registry().context();
        let failure = dataset.query_schema(&ctx, "nope", None).unwrap_err();
        assert!(failure.downcast_ref::<UnknownSchemaError>().is_some());
        assert!(failure.response.is_completed());
        assert_eq!(json!(failure.response.errors), json!(["undefined schema \"nope\""]));
    }
}
