use anyhow::{anyhow, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::context::{Context, QueryOptions};
use crate::errors::{CancelledError, UnknownEndpointError, ValidationError};
use crate::registry::RunContext;
use crate::response::{QueryFailure, QueryResponse};
use crate::step::PipelineStep;
use crate::value::{as_flag, is_zero, to_text, CONTEXT_PREFIX, ROOT_VAR};

/// Ordered steps sharing default context and validation rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(flatten)]
    pub context: Context,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    /// Requirements on the merged params and variables of every step.
    #[serde(default, skip_serializing_if = "Context::is_empty")]
    pub required: Context,
    #[serde(default)]
    pub steps: Vec<PipelineStep>,
}

impl Pipeline {
    /// Run every step in order against `options`, accumulating results by
    /// step key. On failure the partial response is returned with the error.
    pub fn query(&self, ctx: &RunContext, options: Option<&QueryOptions>) -> Result<QueryResponse, QueryFailure> {
        let response = QueryResponse::new(None);
        let ctx = ctx.scoped("pipeline", self.name.as_str());

        let defaults = QueryOptions {
            context: self.context.clone(),
            ..QueryOptions::default()
        };
        let base = defaults.merge_opt(options);

        let mut results = Map::new();
        let mut omitted = Vec::new();

        for (index, step) in self.steps.iter().enumerate() {
            let number = index + 1;
            let key = step.result_key();

            if let Err(err) = ctx.ensure_not_cancelled() {
                return Err(response.failed(err));
            }

            let mut merged = base.merge_opt(step.query.as_ref());
            merged
                .context
                .variables
                .insert(ROOT_VAR.to_string(), Value::Object(results.clone()));

            if let Err(err) = self.validate(&merged) {
                return Err(response.failed(err));
            }
            if step.skip {
                continue;
            }
            if step.omit {
                omitted.push(key.clone());
            }

            let step_ctx = ctx.scoped("step", key.as_str());
            step_ctx
                .logger()
                .debug("step started", Some(json!({ "step": number, "endpoint": merged.endpoint })));

            let accumulated = Value::Object(results.clone());
            match step.retrieve(&step_ctx, &merged, &accumulated) {
                Ok(output) => {
                    step_ctx.logger().debug("step finished", Some(json!({ "step": number })));
                    results.insert(key.clone(), output.result);
                    if step.with_context {
                        results.insert(format!("{CONTEXT_PREFIX}{key}"), Value::Object(output.context));
                    }
                }
                Err(err) if step.optional && !is_fatal(&err) => {
                    step_ctx.logger().debug(
                        "optional step failed",
                        Some(json!({ "step": number, "error": format!("{err:#}") })),
                    );
                    results.insert(key.clone(), Value::Null);
                    if step.with_context {
                        results.insert(format!("{CONTEXT_PREFIX}{key}"), Value::Null);
                    }
                }
                Err(err) => {
                    return Err(response.failed(err.context(format!("step {number} [{key}]"))));
                }
            }
        }

        for key in &omitted {
            results.shift_remove(key);
        }

        response.complete(Some(Value::Object(results)))
    }

    /// Check the merged options of one step against the `required` rules.
    pub fn validate(&self, merged: &QueryOptions) -> Result<()> {
        check_rules(&self.name, "param", &self.required.params, &merged.context.params)?;
        if !merged.context.variables.contains_key(ROOT_VAR) {
            return Err(anyhow!("pipeline {}: no ${ROOT_VAR} variable to validate against", self.name));
        }
        check_rules(&self.name, "variable", &self.required.variables, &merged.context.variables)
    }
}

/// Errors an optional step must not swallow.
fn is_fatal(err: &anyhow::Error) -> bool {
    err.is::<CancelledError>() || err.is::<UnknownEndpointError>()
}

fn check_rules(
    pipeline: &str,
    facet: &'static str,
    rules: &Map<String, Value>,
    values: &Map<String, Value>,
) -> Result<()> {
    for (name, rule) in rules {
        // null and false state no requirement
        if matches!(rule, Value::Null | Value::Bool(false)) {
            continue;
        }

        let violation = |pattern: Option<String>| ValidationError {
            pipeline: pipeline.to_string(),
            facet,
            name: name.clone(),
            pattern,
        };

        if as_flag(rule) {
            if values.get(name).map_or(true, is_zero) {
                return Err(violation(None).into());
            }
            continue;
        }

        let pattern = to_text(rule);
        let value = values.get(name).map(to_text).unwrap_or_default();
        let matched = Regex::new(&pattern).map_or(false, |re| re.is_match(&value));
        if !matched {
            return Err(violation(Some(pattern)).into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(value: Value) -> Pipeline {
        serde_json::from_value(value).unwrap()
    }

    fn merged(value: Value) -> QueryOptions {
        let mut options: QueryOptions = serde_json::from_value(value).unwrap();
        options.context.variables.insert(ROOT_VAR.to_string(), json!({}));
        options
    }

    #[test]
    fn flattened_context_is_read_from_the_top_level() {
        let p = pipeline(json!({
            "name": "p",
            "headers": { "Accept": "application/json" },
            "required": { "params": { "env": true } },
            "steps": [{ "query": { "endpoint": "users" } }]
        }));
        assert_eq!(p.context.headers["Accept"], "application/json");
        assert_eq!(p.required.params["env"], true);
        assert_eq!(p.steps[0].result_key(), "users");
    }

    #[test]
    fn required_flags_demand_a_present_value() {
        let p = pipeline(json!({ "name": "p", "required": { "params": { "env": true } } }));
        let err = p.validate(&merged(json!({}))).unwrap_err();
        let violation = err.downcast_ref::<ValidationError>().unwrap();
        assert_eq!(violation.facet, "param");
        assert_eq!(violation.name, "env");
        assert_eq!(err.to_string(), "pipeline p param: value for 'env' is missing");

        assert!(p.validate(&merged(json!({ "params": { "env": "" } }))).is_err());
        assert!(p.validate(&merged(json!({ "params": { "env": "prod" } }))).is_ok());
    }

    #[test]
    fn textual_rules_are_patterns() {
        let p = pipeline(json!({ "required": { "variables": { "env": "^(dev|prod)$" } } }));
        assert!(p.validate(&merged(json!({ "variables": { "env": "prod" } }))).is_ok());
        let err = p
            .validate(&merged(json!({ "variables": { "env": "staging" } })))
            .unwrap_err();
        let violation = err.downcast_ref::<ValidationError>().unwrap();
        assert_eq!(violation.pattern.as_deref(), Some("^(dev|prod)$"));
    }

    #[test]
    fn false_rules_are_ignored() {
        let p = pipeline(json!({ "required": { "params": { "env": false, "other": null } } }));
        assert!(p.validate(&merged(json!({}))).is_ok());
    }

    #[test]
    fn missing_root_is_an_internal_fault() {
        let p = pipeline(json!({}));
        let err = p.validate(&QueryOptions::new()).unwrap_err();
        assert!(err.downcast_ref::<ValidationError>().is_none());
        assert!(err.to_string().contains("$root"));
    }
}
