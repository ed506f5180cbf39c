use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use eyre::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{loader::load_api_definitions, models::ApiDefinition},
    ports::deployment::DeploymentSource,
};

/// Deployment source reading API definitions from a file or a directory of files, and
/// watching it for changes.
pub struct FileDeploymentSource {
    path: PathBuf,
    // kept alive for the lifetime of the source
    _watcher: Option<notify::RecommendedWatcher>,
    update_tx: mpsc::Sender<()>,
    update_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileDeploymentSource {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (tx, rx) = mpsc::channel(1);

        let mut source = Self {
            path,
            _watcher: None,
            update_tx: tx,
            update_rx: Mutex::new(Some(rx)),
        };
        source.init_watcher()?;
        Ok(source)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_watcher(&mut self) -> Result<()> {
        let tx = self.update_tx.clone();
        // a single file is watched through its parent directory
        let (watch_dir, file_name) = if self.path.is_dir() {
            (self.path.clone(), None)
        } else {
            let file_name = self
                .path
                .file_name()
                .ok_or_else(|| eyre::eyre!("Invalid API definitions path: {}", self.path.display()))?
                .to_owned();
            let parent = self
                .path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            (parent.to_path_buf(), Some(file_name))
        };

        let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                let relevant = event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove();
                let ours = match &file_name {
                    Some(name) => event.paths.iter().any(|p| p.file_name() == Some(name.as_os_str())),
                    None => true,
                };
                if relevant && ours {
                    tracing::debug!(kind = ?event.kind, "API definitions changed");
                    // a pending signal already covers this change
                    let _ = tx.try_send(());
                }
            }
            Err(e) => tracing::error!(error = ?e, "API definitions watch error"),
        })?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .wrap_err_with(|| format!("Failed to watch {}", watch_dir.display()))?;

        self._watcher = Some(watcher);
        Ok(())
    }
}

#[async_trait]
impl DeploymentSource for FileDeploymentSource {
    async fn load(&self) -> Result<Vec<ApiDefinition>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || load_api_definitions(path))
            .await
            .wrap_err("API definitions loader panicked")?
    }

    fn watch(&self) -> Result<mpsc::Receiver<()>> {
        self.update_rx
            .lock()
            .map_err(|_| eyre::eyre!("Deployment watch state poisoned"))?
            .take()
            .ok_or_else(|| eyre::eyre!("watch() can only be called once"))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;
    use tokio::time::{Duration, sleep};

    use super::*;

    fn definition(id: &str, target: &str) -> String {
        format!(
            r#"
id: {id}
listeners:
  - path: /{id}
endpoint_groups:
  - name: default-group
    type: http-proxy
    endpoints:
      - name: default
        configuration:
          target: {target}
"#
        )
    }

    #[tokio::test]
    async fn test_directory_source_loads_and_signals_changes() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("orders.yaml"), definition("orders", "http://localhost:9000"))?;

        let source = FileDeploymentSource::new(dir.path())?;
        let apis = source.load().await?;
        assert_eq!(apis.len(), 1);
        assert_eq!(apis[0].id, "orders");

        let mut rx = source.watch()?;
        assert!(source.watch().is_err());

        sleep(Duration::from_millis(100)).await;
        fs::write(dir.path().join("billing.yaml"), definition("billing", "http://localhost:9001"))?;

        let notification = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(matches!(notification, Ok(Some(()))), "no change notification");

        let ids: Vec<String> = source.load().await?.into_iter().map(|api| api.id).collect();
        assert_eq!(ids, vec!["billing", "orders"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_single_file_source() -> Result<()> {
        let dir = tempdir()?;
        let file = dir.path().join("orders.yaml");
        fs::write(&file, definition("orders", "http://localhost:9000"))?;

        let source = FileDeploymentSource::new(&file)?;
        assert_eq!(source.load().await?[0].id, "orders");
        Ok(())
    }
}
