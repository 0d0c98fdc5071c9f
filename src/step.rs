use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context as _, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::context::QueryOptions;
use crate::endpoint::Endpoint;
use crate::errors::{CancelledError, ForeachTypeError};
use crate::expr::apply_expressions;
use crate::query::execute_query;
use crate::registry::RunContext;
use crate::response::QueryFailure;
use crate::value::{kind_name, DEFAULT_RESULT_KEY, ROOT_VAR};

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// One stage of a pipeline: an optional endpoint call (possibly repeated per
/// `foreach` element) followed by transforms.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineStep {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    /// Result key; defaults to the endpoint name, then `result`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryOptions>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub omit: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub with_context: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
    #[serde(default)]
    pub parallel: bool,
}

/// What a step produced, and the context it ran with.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub result: Value,
    pub context: Map<String, Value>,
}

struct Iteration {
    vars: Map<String, Value>,
    options: QueryOptions,
}

impl PipelineStep {
    pub fn result_key(&self) -> String {
        if !self.target.is_empty() {
            return self.target.clone();
        }
        match &self.query {
            Some(query) if !query.endpoint.is_empty() => query.endpoint.clone(),
            _ => DEFAULT_RESULT_KEY.to_string(),
        }
    }

    /// Run the step with the pipeline-merged `parent` options against the
    /// results `accumulated` so far.
    pub fn retrieve(&self, ctx: &RunContext, parent: &QueryOptions, accumulated: &Value) -> Result<StepOutput> {
        let engine = ctx.engine();
        let mut result = accumulated.clone();

        let mut vars = parent.render_variables(&result, engine)?;
        let mut query = parent.merge_opt(self.query.as_ref());
        query
            .context
            .variables
            .insert(ROOT_VAR.to_string(), accumulated.clone());
        if self.query.is_some() {
            vars = query.render_variables(&result, engine)?;
        }

        let mut bound = vars.clone();
        bound.insert(ROOT_VAR.to_string(), accumulated.clone());

        let mut context = Map::new();
        context.insert("vars".to_string(), Value::Object(vars.clone()));
        context.insert(ROOT_VAR.to_string(), accumulated.clone());

        if !query.endpoint.is_empty() {
            let endpoint = ctx.endpoint(&query.endpoint)?;

            if query.foreach.trim().is_empty() {
                ctx.ensure_not_cancelled()?;
                let rendered = query.render(&result, engine)?;
                result = execute_query(ctx, &rendered, &endpoint)
                    .map_err(QueryFailure::into_error)?
                    .result;
            } else {
                let elements = engine
                    .compile(&query.foreach)
                    .and_then(|selector| selector.evaluate(&result, &bound))
                    .context("foreach")?;
                let elements = match elements {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    other => {
                        return Err(ForeachTypeError {
                            kind: kind_name(&other),
                        }
                        .into())
                    }
                };

                let mut iterations = Vec::with_capacity(elements.len());
                for (index, element) in elements.into_iter().enumerate() {
                    let mut item_vars = vars.clone();
                    item_vars.insert("item".to_string(), element);
                    item_vars.insert("index".to_string(), json!(index));
                    let options = query.render(&Value::Object(item_vars.clone()), engine)?;
                    iterations.push(Iteration {
                        vars: item_vars,
                        options,
                    });
                }

                let (outputs, elements) = if self.parallel {
                    self.fan_out_parallel(ctx, &endpoint, iterations)?
                } else {
                    self.fan_out_sequential(ctx, &endpoint, iterations)?
                };
                result = Value::Array(outputs);
                context.insert("elements".to_string(), Value::Array(elements));
            }
        }

        let result = apply_expressions(engine, result, &bound, &self.transforms).context("output filters")?;
        Ok(StepOutput { result, context })
    }

    fn skippable(&self, err: &anyhow::Error) -> bool {
        self.optional && !err.is::<CancelledError>()
    }

    fn fan_out_sequential(
        &self,
        ctx: &RunContext,
        endpoint: &Arc<Endpoint>,
        iterations: Vec<Iteration>,
    ) -> Result<(Vec<Value>, Vec<Value>)> {
        let mut outputs = Vec::new();
        let mut contexts = Vec::new();
        for (index, iteration) in iterations.into_iter().enumerate() {
            ctx.ensure_not_cancelled()?;
            match execute_query(ctx, &iteration.options, endpoint) {
                Ok(response) => {
                    outputs.push(response.result);
                    contexts.push(Value::Object(iteration.vars));
                }
                Err(failure) => {
                    let err = failure.into_error();
                    if !self.skippable(&err) {
                        return Err(err.context(format!("foreach item {index}")));
                    }
                    ctx.logger().debug(
                        "skipping failed foreach item",
                        Some(json!({ "index": index, "error": format!("{err:#}") })),
                    );
                }
            }
        }
        Ok((outputs, contexts))
    }

    /// Every iteration runs on its own scoped thread; all of them are joined
    /// before any failure is reported, and outputs keep the element order.
    fn fan_out_parallel(
        &self,
        ctx: &RunContext,
        endpoint: &Arc<Endpoint>,
        iterations: Vec<Iteration>,
    ) -> Result<(Vec<Value>, Vec<Value>)> {
        let outcomes: Vec<Result<Value>> = thread::scope(|scope| {
            let handles: Vec<_> = iterations
                .iter()
                .enumerate()
                .map(|(index, iteration)| {
                    let ctx = ctx.scoped("index", index);
                    scope.spawn(move || -> Result<Value> {
                        ctx.ensure_not_cancelled()?;
                        execute_query(&ctx, &iteration.options, endpoint)
                            .map(|response| response.result)
                            .map_err(QueryFailure::into_error)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow!("foreach iteration panicked")))
                })
                .collect()
        });

        let mut outputs = Vec::new();
        let mut contexts = Vec::new();
        let mut first_error = None;
        for (index, (iteration, outcome)) in iterations.into_iter().zip(outcomes).enumerate() {
            match outcome {
                Ok(output) => {
                    outputs.push(output);
                    contexts.push(Value::Object(iteration.vars));
                }
                Err(err) if self.skippable(&err) => {
                    ctx.logger().debug(
                        "skipping failed foreach item",
                        Some(json!({ "index": index, "error": format!("{err:#}") })),
                    );
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err.context(format!("foreach item {index}")));
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok((outputs, contexts)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::UnknownEndpointError;
    use crate::registry::Registry;
    use crate::transport::HttpRequest;

    fn registry(names: &[&str]) -> Registry {
        let mut builder = Registry::builder();
        for name in names {
            builder.register(name, Endpoint::new(format!("http://api.local/{name}/{{{{ .params.id }}}}")));
        }
        builder.build()
    }

    fn step(value: Value) -> PipelineStep {
        serde_json::from_value(value).unwrap()
    }

    fn echo_path(request: &HttpRequest) -> Result<Value> {
        Ok(json!({ "path": request.url.path() }))
    }

    #[test]
    fn result_key_prefers_target_then_endpoint() {
        assert_eq!(step(json!({ "target": "t", "query": { "endpoint": "e" } })).result_key(), "t");
        assert_eq!(step(json!({ "query": { "endpoint": "e" } })).result_key(), "e");
        assert_eq!(step(json!({})).result_key(), "result");
    }

    #[test]
    fn foreach_calls_once_per_element() -> Result<()> {
        let ctx = registry(&["users"]).context().with_transport(echo_path);
        let step = step(json!({
            "query": {
                "endpoint": "users",
                "foreach": "$root.ids",
                "params_json": { "id": "item" }
            },
            "with_context": true
        }));
        let accumulated = json!({ "ids": ["a", "b"] });
        let parent = QueryOptions::new().with_variable(ROOT_VAR, accumulated.clone());
        let output = step.retrieve(&ctx, &parent, &accumulated)?;
        assert_eq!(
            output.result,
            json!([{ "path": "/users/a" }, { "path": "/users/b" }])
        );
        let elements = output.context["elements"].as_array().unwrap();
        assert_eq!(elements[1]["item"], "b");
        assert_eq!(elements[1]["index"], 1);
        Ok(())
    }

    #[test]
    fn foreach_requires_a_list() {
        let ctx = registry(&["users"]).context().with_transport(echo_path);
        let step = step(json!({ "query": { "endpoint": "users", "foreach": "{ \"a\": 1 }" } }));
        let err = step.retrieve(&ctx, &QueryOptions::new(), &json!({})).unwrap_err();
        assert_eq!(err.downcast_ref::<ForeachTypeError>().map(|e| e.kind), Some("object"));
    }

    #[test]
    fn empty_foreach_yields_an_empty_list() -> Result<()> {
        let ctx = registry(&["users"]).context().with_transport(echo_path);
        let step = step(json!({ "query": { "endpoint": "users", "foreach": "missing" } }));
        let output = step.retrieve(&ctx, &QueryOptions::new(), &json!({}))?;
        assert_eq!(output.result, json!([]));
        Ok(())
    }

    #[test]
    fn unknown_endpoint_is_reported() {
        let ctx = registry(&[]).context().with_transport(echo_path);
        let step = step(json!({ "query": { "endpoint": "ghost" } }));
        let err = step.retrieve(&ctx, &QueryOptions::new(), &json!({})).unwrap_err();
        assert!(err.is::<UnknownEndpointError>());
    }

    #[test]
    fn steps_without_endpoint_transform_the_accumulated_results() -> Result<()> {
        let ctx = registry(&[]).context().with_transport(echo_path);
        let step = step(json!({ "transforms": ["$keys(manifest)"] }));
        let output = step.retrieve(&ctx, &QueryOptions::new(), &json!({ "manifest": { "dev": 1, "prod": 2 } }))?;
        assert_eq!(output.result, json!(["dev", "prod"]));
        Ok(())
    }

    #[test]
    fn optional_sequential_failures_skip_the_item() -> Result<()> {
        let ctx = registry(&["users"]).context().with_transport(|request: &HttpRequest| -> Result<Value> {
            if request.url.path().ends_with("/bad") {
                Err(anyhow!("boom"))
            } else {
                Ok(json!(request.url.path()))
            }
        });
        let step = step(json!({
            "query": { "endpoint": "users", "foreach": "ids", "params_json": { "id": "item" } },
            "optional": true
        }));
        let output = step.retrieve(&ctx, &QueryOptions::new(), &json!({ "ids": ["a", "bad", "c"] }))?;
        assert_eq!(output.result, json!(["/users/a", "/users/c"]));
        Ok(())
    }
}
