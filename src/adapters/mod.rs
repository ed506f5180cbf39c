pub mod connectors;
pub mod deployment;
pub mod health_checker;
pub mod http_client;
pub mod http_server;
pub mod policies;
pub mod reporters;

/// Re-export commonly used types from adapters
pub use connectors::default_connector_registry;
pub use deployment::FileDeploymentSource;
pub use health_checker::HealthChecker;
pub use http_client::HttpClientAdapter;
pub use http_server::HttpServer;
pub use policies::default_policy_registry;
pub use reporters::{LogReporter, MetricsReporter};
