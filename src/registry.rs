use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;

use crate::cancel::Cancellation;
use crate::endpoint::Endpoint;
use crate::errors::UnknownEndpointError;
use crate::expr::{ExpressionEngine, Jsonata};
use crate::logging::Logger;
use crate::transport::{Transport, UreqTransport};

/// Collects endpoint definitions before they are frozen into a [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    endpoints: HashMap<String, Arc<Endpoint>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint` under `name`. Only the part of `name` before the
    /// first `:` is used, and it becomes the endpoint's name. A later
    /// registration under the same name replaces the earlier one.
    pub fn register(&mut self, name: &str, mut endpoint: Endpoint) -> &mut Self {
        let name = name.split(':').next().unwrap_or(name).trim().to_string();
        endpoint.name = name.clone();
        self.endpoints.insert(name, Arc::new(endpoint));
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            inner: Arc::new(self.endpoints),
        }
    }
}

/// Immutable name → endpoint table, shared by every run.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<HashMap<String, Arc<Endpoint>>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("endpoints", &self.names())
            .finish()
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.inner.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn context(&self) -> RunContext {
        RunContext::new(self.clone(), Cancellation::new())
    }

    pub fn context_with_cancellation(&self, cancellation: Cancellation) -> RunContext {
        RunContext::new(self.clone(), cancellation)
    }
}

/// Everything one run needs besides its options: the endpoints, how to reach
/// them, how to evaluate expressions, where to log and when to stop.
///
/// Clones share the registry, transport, engine and cancellation; log tags
/// added through [`RunContext::scoped`] stay with the clone.
#[derive(Clone)]
pub struct RunContext {
    registry: Registry,
    transport: Arc<dyn Transport>,
    engine: Arc<dyn ExpressionEngine>,
    logger: Logger,
    cancellation: Cancellation,
}

impl RunContext {
    fn new(registry: Registry, cancellation: Cancellation) -> Self {
        Self {
            registry,
            transport: Arc::new(UreqTransport::new()),
            engine: Arc::new(Jsonata),
            logger: Logger::from_env(),
            cancellation,
        }
    }

    pub fn with_transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    pub fn with_engine<E: ExpressionEngine + 'static>(mut self, engine: E) -> Self {
        self.engine = Arc::new(engine);
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Put a deadline on the run; HTTP timeouts are capped by what is left.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.cancellation = self.cancellation.with_timeout(timeout);
        self
    }

    /// Clone whose log entries carry `key = value`.
    pub fn scoped(&self, key: &str, value: impl Into<Value>) -> RunContext {
        let mut scoped = self.clone();
        scoped.logger = self.logger.with_tag(key, value);
        scoped
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn engine(&self) -> &dyn ExpressionEngine {
        self.engine.as_ref()
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub fn endpoint(&self, name: &str) -> Result<Arc<Endpoint>> {
        self.registry.get(name).ok_or_else(|| {
            UnknownEndpointError {
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn ensure_not_cancelled(&self) -> Result<()> {
        self.cancellation.ensure_not_cancelled()
    }
}
