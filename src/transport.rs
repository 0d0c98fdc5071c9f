use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use url::Url;

use crate::errors::{DecodeError, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_BODY_LIMIT: usize = 512;

/// One fully resolved HTTP call.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: Url,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Performs one request and returns the decoded JSON body.
///
/// Non-success statuses fail with [`TransportError`], bodies that are not
/// JSON with [`DecodeError`]. An empty body decodes to `null`.
pub trait Transport: Send + Sync {
    fn execute(&self, request: &HttpRequest) -> Result<Value>;
}

impl<F> Transport for F
where
    F: Fn(&HttpRequest) -> Result<Value> + Send + Sync,
{
    fn execute(&self, request: &HttpRequest) -> Result<Value> {
        self(request)
    }
}

#[derive(Debug, Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UreqTransport {
    pub fn new() -> Self {
        Self::with_agent(ureq::AgentBuilder::new().timeout_connect(CONNECT_TIMEOUT).build())
    }

    pub fn with_agent(agent: ureq::Agent) -> Self {
        Self { agent }
    }
}

impl Transport for UreqTransport {
    fn execute(&self, request: &HttpRequest) -> Result<Value> {
        let url = request.url.as_str();
        let mut call = self.agent.request(&request.method, url);
        for (name, value) in &request.params {
            call = call.query(name, value);
        }
        for (name, value) in &request.headers {
            call = call.set(name, value);
        }
        if let Some(timeout) = request.timeout {
            call = call.timeout(timeout);
        }

        let outcome = match &request.body {
            Some(body) => call.send_json(body),
            None => call.call(),
        };

        let response = match outcome {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let mut body = response.into_string().unwrap_or_default();
                if body.len() > ERROR_BODY_LIMIT {
                    let mut cut = ERROR_BODY_LIMIT;
                    while !body.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    body.truncate(cut);
                }
                return Err(TransportError {
                    url: url.to_string(),
                    status: Some(status),
                    message: body.trim().to_string(),
                }
                .into());
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(TransportError {
                    url: url.to_string(),
                    status: None,
                    message: err.to_string(),
                }
                .into())
            }
        };

        let text = response.into_string().map_err(|err| TransportError {
            url: url.to_string(),
            status: None,
            message: format!("reading body: {err}"),
        })?;
        decode_body(url, &text)
    }
}

pub fn decode_body(url: &str, text: &str) -> Result<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|err| {
        DecodeError {
            url: url.to_string(),
            message: err.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_bodies_decode_to_null() {
        assert_eq!(decode_body("http://x", "  \n").unwrap(), Value::Null);
        assert_eq!(decode_body("http://x", r#"{"a":1}"#).unwrap(), json!({ "a": 1 }));
    }

    #[test]
    fn non_json_bodies_are_decode_errors() {
        let err = decode_body("http://x", "<html>").unwrap_err();
        assert!(err.is::<DecodeError>());
    }

    #[test]
    fn closures_are_transports() {
        let transport = |request: &HttpRequest| -> Result<Value> {
            Ok(json!({ "path": request.url.path(), "h": request.header("x-token") }))
        };
        let request = HttpRequest {
            method: "GET".into(),
            url: Url::parse("http://localhost/a/b").unwrap(),
            params: Vec::new(),
            headers: vec![("X-Token".into(), "t".into())],
            body: None,
            timeout: None,
        };
        let out = Transport::execute(&transport, &request).unwrap();
        assert_eq!(out, json!({ "path": "/a/b", "h": "t" }));
    }
}
