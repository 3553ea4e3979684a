pub mod config_providers;
pub mod health_checker;
pub mod http_client;
pub mod http_handler;

/// Re-export commonly used types from adapters
pub use config_providers::FileConfigProvider;
pub use health_checker::ProxyHealthChecker;
pub use http_client::ReqwestExecutor;
pub use http_handler::{AppState, router};
