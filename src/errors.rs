use std::fmt;
use std::path::PathBuf;

/// Malformed configuration or dataset definitions.
#[derive(Debug)]
pub struct ConfigError {
    pub path: Option<PathBuf>,
    pub message: String,
}

impl ConfigError {
    pub fn new(path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            path,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "config error in {}: {}", path.display(), self.message),
            None => write!(f, "config error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

/// A pipeline step references an endpoint that no dataset defines.
#[derive(Debug)]
pub struct UndefinedEndpointError {
    pub query: String,
    pub step: usize,
    pub endpoint: String,
}

impl fmt::Display for UndefinedEndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "query {}, step {}: undefined endpoint {:?}",
            self.query, self.step, self.endpoint
        )
    }
}

impl std::error::Error for UndefinedEndpointError {}

#[derive(Debug)]
pub struct ValidationError {
    pub pipeline: String,
    pub facet: &'static str,
    pub name: String,
    pub pattern: Option<String>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pattern {
            Some(pattern) => write!(
                f,
                "pipeline {} {}: value for '{}' must match expression '{}'",
                self.pipeline, self.facet, self.name, pattern
            ),
            None => write!(
                f,
                "pipeline {} {}: value for '{}' is missing",
                self.pipeline, self.facet, self.name
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug)]
pub struct UnknownEndpointError {
    pub name: String,
}

impl fmt::Display for UnknownEndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "undefined endpoint {:?}", self.name)
    }
}

impl std::error::Error for UnknownEndpointError {}

#[derive(Debug)]
pub struct UnknownSchemaError {
    pub name: String,
}

impl fmt::Display for UnknownSchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "undefined schema {:?}", self.name)
    }
}

impl std::error::Error for UnknownSchemaError {}

/// The `foreach` expression of a step produced something other than a list.
#[derive(Debug)]
pub struct ForeachTypeError {
    pub kind: &'static str,
}

impl fmt::Display for ForeachTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "foreach: expression must return an array, got {}", self.kind)
    }
}

impl std::error::Error for ForeachTypeError {}

#[derive(Debug)]
pub struct TransportError {
    pub url: String,
    pub status: Option<u16>,
    pub message: String,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} responded {}: {}", self.url, status, self.message),
            None => write!(f, "{}: {}", self.url, self.message),
        }
    }
}

impl std::error::Error for TransportError {}

#[derive(Debug)]
pub struct DecodeError {
    pub url: String,
    pub message: String,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: undecodable response body: {}", self.url, self.message)
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionPhase {
    Compile,
    Eval,
}

#[derive(Debug, Clone)]
pub struct ExpressionError {
    pub phase: ExpressionPhase,
    pub expression: String,
    pub message: String,
}

impl ExpressionError {
    pub fn compile(expression: &str, message: impl Into<String>) -> Self {
        Self {
            phase: ExpressionPhase::Compile,
            expression: expression.to_string(),
            message: message.into(),
        }
    }

    pub fn eval(expression: &str, message: impl Into<String>) -> Self {
        Self {
            phase: ExpressionPhase::Eval,
            expression: expression.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ExpressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.phase {
            ExpressionPhase::Compile => "compile",
            ExpressionPhase::Eval => "eval",
        };
        write!(f, "{phase}: {} (in `{}`)", self.message, self.expression)
    }
}

impl std::error::Error for ExpressionError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateError {
    pub template: String,
    pub message: String,
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "template {:?}: {}", self.template, self.message)
    }
}

impl std::error::Error for TemplateError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphQLError {
    pub path: String,
    pub message: String,
}

impl fmt::Display for GraphQLError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "graphql: {}", self.message)
        } else {
            write!(f, "graphql [{}]: {}", self.path, self.message)
        }
    }
}

impl std::error::Error for GraphQLError {}

#[derive(Debug)]
pub struct CancelledError;

impl fmt::Display for CancelledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "execution cancelled")
    }
}

impl std::error::Error for CancelledError {}
