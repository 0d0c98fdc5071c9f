use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Map, Value};
use url::Url;

use crate::context::QueryOptions;
use crate::endpoint::Endpoint;
use crate::errors::{CancelledError, TransportError};
use crate::expr::apply_expressions;
use crate::registry::RunContext;
use crate::response::{QueryFailure, QueryResponse};
use crate::template;
use crate::transport::HttpRequest;
use crate::value::{merge_non_zero, to_text};

fn overlay(defaults: &Map<String, Value>, overrides: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = defaults.clone();
    merge_non_zero(&mut merged, overrides);
    merged
}

/// Query-string and header pairs; lists repeat the key, nulls are dropped.
fn pairs(map: &Map<String, Value>) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (key, value) in map {
        match value {
            Value::Null => {}
            Value::Array(items) => out.extend(
                items
                    .iter()
                    .filter(|item| !item.is_null())
                    .map(|item| (key.clone(), to_text(item))),
            ),
            other => out.push((key.clone(), to_text(other))),
        }
    }
    out
}

/// One round trip to `endpoint` with already rendered `options`.
///
/// The endpoint's defaults are overlaid by the options, the URL template is
/// rendered, the request is sent, and the endpoint filters followed by the
/// option transforms reshape the decoded body. Failures still produce a
/// finalized response, returned inside the [`QueryFailure`].
pub fn execute_query(
    ctx: &RunContext,
    options: &QueryOptions,
    endpoint: &Arc<Endpoint>,
) -> Result<QueryResponse, QueryFailure> {
    let mut response = QueryResponse::new(Some(endpoint.clone()));
    response.query = Some(options.clone());

    let headers = overlay(&endpoint.headers, &options.context.headers);
    let params = overlay(&endpoint.params, &options.context.params);
    let vars = overlay(&endpoint.variables, &options.context.variables);
    let path = overlay(&endpoint.path_params, &options.path_params);

    response
        .context
        .insert("vars".to_string(), Value::Object(vars.clone()));
    response
        .context
        .insert("params".to_string(), Value::Object(params.clone()));
    response
        .context
        .insert("headers".to_string(), Value::Object(headers.clone()));

    let request = Request {
        ctx,
        options,
        endpoint,
        headers,
        params,
        vars,
        path,
    };
    match request.perform(&mut response) {
        Ok(result) => response.complete(Some(result)),
        Err(err) => Err(response.failed(err)),
    }
}

struct Request<'a> {
    ctx: &'a RunContext,
    options: &'a QueryOptions,
    endpoint: &'a Endpoint,
    headers: Map<String, Value>,
    params: Map<String, Value>,
    vars: Map<String, Value>,
    path: Map<String, Value>,
}

impl Request<'_> {
    fn perform(&self, response: &mut QueryResponse) -> Result<Value> {
        self.ctx.ensure_not_cancelled()?;

        let template_data = json!({
            "vars": self.vars,
            "params": self.params,
            "headers": self.headers,
            "path": self.path,
        });
        let rendered = template::render(&self.endpoint.url, &template_data)?;
        let url = Url::parse(&rendered).map_err(|err| TransportError {
            url: rendered.clone(),
            status: None,
            message: format!("invalid URL: {err}"),
        })?;

        let body = match &self.endpoint.graphql {
            Some(gql) => {
                let document = gql.render()?;
                let mut variables = gql.variables.clone();
                variables.extend(self.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
                let body = json!({
                    "name": gql.name,
                    "query": document,
                    "variables": variables,
                });
                response.context.insert("graphql".to_string(), body.clone());
                Some(body)
            }
            None if !self.endpoint.request_body.is_null() => Some(self.endpoint.request_body.clone()),
            None => None,
        };

        let request = HttpRequest {
            method: self.endpoint.effective_method(),
            url,
            params: pairs(&self.params),
            headers: pairs(&self.headers),
            body,
            timeout: self.ctx.cancellation().remaining(),
        };

        self.ctx.logger().debug(
            "calling endpoint",
            Some(json!({
                "endpoint": self.endpoint.name,
                "method": request.method,
                "url": request.url.as_str(),
            })),
        );

        let decoded = match self.ctx.transport().execute(&request) {
            Ok(decoded) => decoded,
            // a deadline that expires mid-flight surfaces as a transport timeout
            Err(_) if self.ctx.is_cancelled() => return Err(CancelledError.into()),
            Err(err) => return Err(err),
        };

        let engine = self.ctx.engine();
        let filtered = apply_expressions(engine, decoded, &self.vars, &self.endpoint.result_filters)?;
        let transformed = apply_expressions(engine, filtered, &self.vars, &self.options.transforms)?;
        Ok(transformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ExpressionError, TemplateError};
    use crate::graphql::GraphQLQuery;
    use crate::registry::Registry;
    use std::sync::Mutex;

    fn recording(
        reply: Value,
    ) -> (
        Arc<Mutex<Vec<HttpRequest>>>,
        impl Fn(&HttpRequest) -> Result<Value> + Send + Sync + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let transport = move |request: &HttpRequest| -> Result<Value> {
            sink.lock().unwrap().push(request.clone());
            Ok(reply.clone())
        };
        (seen, transport)
    }

    fn endpoint(url: &str) -> Arc<Endpoint> {
        let mut endpoint = Endpoint::new(url);
        endpoint.name = "test".into();
        Arc::new(endpoint)
    }

    #[test]
    fn query_values_override_endpoint_defaults() -> Result<()> {
        let (seen, transport) = recording(json!({ "ok": true }));
        let ctx = Registry::default().context().with_transport(transport);
        let mut ep = Endpoint::new("http://api.local/orgs/{{ .vars.org }}/repos");
        ep.headers.insert("Accept".into(), json!("application/json"));
        ep.params.insert("per_page".into(), json!(10));
        ep.variables.insert("org".into(), json!("default"));

        let options = QueryOptions::new()
            .with_variable("org", "acme")
            .with_param("per_page", 50)
            .with_header("X-Trace", "t1");
        let response = execute_query(&ctx, &options, &Arc::new(ep)).map_err(QueryFailure::into_error)?;
        assert_eq!(response.result, json!({ "ok": true }));
        assert_eq!(response.context["vars"], json!({ "org": "acme" }));

        let requests = seen.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.method, "GET");
        assert_eq!(request.url.as_str(), "http://api.local/orgs/acme/repos");
        assert_eq!(request.param("per_page"), Some("50"));
        assert_eq!(request.header("accept"), Some("application/json"));
        assert_eq!(request.header("x-trace"), Some("t1"));
        Ok(())
    }

    #[test]
    fn filters_run_before_transforms() -> Result<()> {
        let (_, transport) = recording(json!({ "data": { "items": [{ "id": 1 }, { "id": 2 }] } }));
        let ctx = Registry::default().context().with_transport(transport);
        let mut ep = Endpoint::new("http://api.local/items");
        ep.result_filters = vec![json!("data.items")];
        let mut options = QueryOptions::new();
        options.transforms = vec![json!("$count($)")];
        let response = execute_query(&ctx, &options, &Arc::new(ep)).map_err(QueryFailure::into_error)?;
        assert_eq!(response.result, json!(2));
        Ok(())
    }

    #[test]
    fn graphql_endpoints_post_the_compiled_document() -> Result<()> {
        let (seen, transport) = recording(json!({ "data": {} }));
        let ctx = Registry::default().context().with_transport(transport);
        let mut ep = Endpoint::new("http://api.local/graphql");
        let gql: GraphQLQuery = serde_json::from_value(json!({
            "name": "Viewer",
            "query": { "Viewer": { "@vars": { "$id": "ID" }, "user": { "@args": { "id": "$id" }, "name": null } } },
            "variables": { "id": "default", "limit": 5 }
        }))?;
        ep.graphql = Some(gql);

        let options = QueryOptions::new().with_variable("id", "u1");
        let response = execute_query(&ctx, &options, &Arc::new(ep)).map_err(QueryFailure::into_error)?;

        let requests = seen.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.method, "POST");
        let body = request.body.clone().unwrap();
        assert_eq!(body["name"], "Viewer");
        assert_eq!(body["variables"], json!({ "id": "u1", "limit": 5 }));
        assert!(body["query"].as_str().unwrap().starts_with("query Viewer($id: ID)"));
        assert_eq!(response.context["graphql"], body);
        Ok(())
    }

    #[test]
    fn template_errors_fail_before_any_request() {
        let (seen, transport) = recording(Value::Null);
        let ctx = Registry::default().context().with_transport(transport);
        let failure = execute_query(&ctx, &QueryOptions::new(), &endpoint("http://x/{{ .vars.id")).unwrap_err();
        assert!(failure.downcast_ref::<TemplateError>().is_some());
        assert!(failure.response.is_completed());
        assert_eq!(failure.response.errors.len(), 1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn transport_errors_are_recorded() {
        let ctx = Registry::default().context().with_transport(|request: &HttpRequest| -> Result<Value> {
            Err(TransportError {
                url: request.url.to_string(),
                status: Some(502),
                message: "bad gateway".into(),
            }
            .into())
        });
        let failure = execute_query(&ctx, &QueryOptions::new(), &endpoint("http://x/")).unwrap_err();
        assert_eq!(failure.downcast_ref::<TransportError>().and_then(|e| e.status), Some(502));
        assert_eq!(failure.response.errors, vec!["http://x/ responded 502: bad gateway"]);
    }

    #[test]
    fn broken_filters_fail_the_call() {
        let (_, transport) = recording(json!({}));
        let ctx = Registry::default().context().with_transport(transport);
        let mut ep = Endpoint::new("http://x/");
        ep.result_filters = vec![json!("$count(")];
        let failure = execute_query(&ctx, &QueryOptions::new(), &Arc::new(ep)).unwrap_err();
        assert!(failure.downcast_ref::<ExpressionError>().is_some());
    }

    #[test]
    fn relative_urls_are_rejected() {
        let (_, transport) = recording(json!({}));
        let ctx = Registry::default().context().with_transport(transport);
        let failure = execute_query(&ctx, &QueryOptions::new(), &endpoint("/only/a/path")).unwrap_err();
        assert!(failure.downcast_ref::<TransportError>().is_some());
    }
}
