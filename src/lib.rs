pub mod cancel;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod errors;
pub mod expr;
pub mod graphql;
pub mod logging;
pub mod pipeline;
pub mod query;
pub mod registry;
pub mod response;
pub mod schema;
pub mod step;
pub mod template;
pub mod transport;
pub mod value;

pub use cancel::Cancellation;
pub use config::Config;
pub use context::{Context, QueryOptions};
pub use endpoint::{DataKind, Endpoint};
pub use expr::{CompiledExpression, ExpressionEngine, Jsonata};
pub use graphql::GraphQLQuery;
pub use logging::{Level, Logger};
pub use pipeline::Pipeline;
pub use query::execute_query;
pub use registry::{Registry, RegistryBuilder, RunContext};
pub use response::{QueryFailure, QueryResponse};
pub use schema::{DatasetConfig, Schema};
pub use step::{PipelineStep, StepOutput};
pub use transport::{HttpRequest, Transport, UreqTransport};
