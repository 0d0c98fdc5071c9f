use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use humantime::format_rfc3339;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::context::QueryOptions;
use crate::endpoint::Endpoint;

fn rfc3339<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_rfc3339(*time).to_string())
}

fn rfc3339_opt<S: Serializer>(time: &Option<SystemTime>, serializer: S) -> Result<S::Ok, S::Error> {
    match time {
        Some(time) => rfc3339(time, serializer),
        None => serializer.serialize_none(),
    }
}

/// Outcome of one endpoint call, step or pipeline run. Errors are recorded
/// on the response before it is finalized, so a failed call still carries
/// its timing and debug context.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    #[serde(skip)]
    pub endpoint: Option<Arc<Endpoint>>,
    #[serde(rename = "endpoint", skip_serializing_if = "Option::is_none")]
    pub endpoint_name: Option<String>,
    pub result: Value,
    #[serde(serialize_with = "rfc3339")]
    pub started_at: SystemTime,
    #[serde(serialize_with = "rfc3339_opt")]
    pub completed_at: Option<SystemTime>,
    /// Elapsed milliseconds.
    pub took: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub query: Option<QueryOptions>,
    pub context: Map<String, Value>,
}

impl QueryResponse {
    pub fn new(endpoint: Option<Arc<Endpoint>>) -> Self {
        let endpoint_name = endpoint.as_ref().map(|endpoint| endpoint.name.clone());
        Self {
            endpoint,
            endpoint_name,
            result: Value::Null,
            started_at: SystemTime::now(),
            completed_at: None,
            took: 0,
            errors: Vec::new(),
            query: None,
            context: Map::new(),
        }
    }

    /// Record an error; every line becomes one entry, duplicates are dropped.
    pub fn add_error(&mut self, err: &anyhow::Error) {
        let text = format!("{err:#}");
        for line in text.lines().map(str::trim_end).filter(|line| !line.is_empty()) {
            if !self.errors.iter().any(|existing| existing == line) {
                self.errors.push(line.to_string());
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    fn finalize(&mut self, result: Option<Value>) {
        if let Some(result) = result {
            self.result = result;
        }
        let now = SystemTime::now();
        self.took = now
            .duration_since(self.started_at)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        self.completed_at = Some(now);
    }

    /// Stamp completion; `None` keeps the current result. Fails when errors
    /// were recorded earlier.
    pub fn complete(mut self, result: Option<Value>) -> Result<QueryResponse, QueryFailure> {
        self.finalize(result);
        if self.errors.is_empty() {
            Ok(self)
        } else {
            let error = anyhow::anyhow!(self.errors.join("\n"));
            Err(QueryFailure {
                response: Box::new(self),
                error,
            })
        }
    }

    /// Record `error` and finalize.
    pub fn failed(mut self, error: anyhow::Error) -> QueryFailure {
        self.add_error(&error);
        self.finalize(None);
        QueryFailure {
            response: Box::new(self),
            error,
        }
    }
}

/// A finalized response together with the error that ended it.
#[derive(Debug)]
pub struct QueryFailure {
    pub response: Box<QueryResponse>,
    pub error: anyhow::Error,
}

impl QueryFailure {
    pub fn into_error(self) -> anyhow::Error {
        self.error
    }

    /// The underlying typed error, e.g. `failure.downcast_ref::<CancelledError>()`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

impl fmt::Display for QueryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.error)
    }
}

impl std::error::Error for QueryFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;

    #[test]
    fn errors_split_per_line_and_deduplicate() {
        let mut response = QueryResponse::new(None);
        response.add_error(&anyhow!("first\nsecond"));
        response.add_error(&anyhow!("second"));
        assert_eq!(response.errors, vec!["first", "second"]);
    }

    #[test]
    fn failed_responses_are_still_finalized() {
        let mut endpoint = Endpoint::new("http://example.com");
        endpoint.name = "users".into();
        let failure = QueryResponse::new(Some(Arc::new(endpoint))).failed(anyhow!("boom"));
        assert!(failure.response.is_completed());
        assert_eq!(failure.response.endpoint_name.as_deref(), Some("users"));
        assert_eq!(failure.to_string(), "boom");
    }

    #[test]
    fn complete_keeps_result_when_none_given() {
        let mut response = QueryResponse::new(None);
        response.result = json!([1]);
        let response = response.complete(None).unwrap();
        assert_eq!(response.result, json!([1]));

        let serialized = serde_json::to_value(&response).unwrap();
        assert!(serialized["started_at"].as_str().is_some());
        assert!(serialized.get("endpoint").is_none());
    }
}
