pub mod ai;
pub mod metrics;
pub mod server_kernel;
pub mod service_host;
pub mod test_dependencies;
pub mod traits;

pub use ai::HttpAiClient;
pub use metrics::Metrics;
pub use server_kernel::ServerKernel;
pub use service_host::{Service, ServiceHost};
pub use traits::{
    AcceptAllVerifier, BaseAI, BaseLeaseTokens, BaseRunnerDispatcher, BaseStatusReporter,
    BaseWebhookVerifier, LoggingRunnerDispatcher, LoggingStatusReporter, RandomLeaseTokens,
};
