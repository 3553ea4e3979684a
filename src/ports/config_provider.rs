use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::models::ServerConfig;

/// Source of the server configuration that can signal changes.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn load_config(&self) -> Result<ServerConfig>;

    /// Change notifications; the receiver reloads by calling `load_config`.
    /// Only the first call returns a receiver.
    fn watch(&self) -> Option<mpsc::Receiver<()>>;
}
