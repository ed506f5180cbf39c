use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::models::ApiDefinition;

/// Source of deployable API definitions.
#[async_trait]
pub trait DeploymentSource: Send + Sync {
    /// Load the current set of API definitions.
    async fn load(&self) -> Result<Vec<ApiDefinition>>;

    /// Return a channel that signals when the definitions have changed.
    /// The receiver should trigger a reload by calling `load`.
    fn watch(&self) -> Result<mpsc::Receiver<()>>;
}
