//! Backend selection for new sessions.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::{DockerAdapter, LocalAdapter, ProjectId, SandboxAdapter, SandboxError};
use crate::config::Config;

/// Creates a ready-to-use (initialized) adapter for a project.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn create(&self, project_id: &ProjectId) -> Result<Arc<dyn SandboxAdapter>>;
}

/// Production factory: the remote Docker backend when an endpoint is
/// configured, the local backend otherwise or when remote provisioning fails.
pub struct BackendSelector {
    config: Config,
}

impl BackendSelector {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    async fn create_remote(&self, project_id: &ProjectId) -> Result<Arc<dyn SandboxAdapter>> {
        let adapter = DockerAdapter::provision(
            project_id,
            &self.config.remote,
            &self.config.shell,
            self.config.manager.default_preview_port,
        )
        .await?;

        if let Err(e) = adapter.init().await {
            adapter.dispose().await;
            return Err(SandboxError::provisioning(format!("{e:#}")).into());
        }
        Ok(Arc::new(adapter))
    }

    async fn create_local(&self, project_id: &ProjectId) -> Result<Arc<dyn SandboxAdapter>> {
        let adapter = LocalAdapter::new(
            project_id,
            &self.config.local.root_dir()?,
            &self.config.shell,
            self.config.manager.default_preview_port,
        )?;
        adapter.init().await?;
        Ok(Arc::new(adapter))
    }
}

#[async_trait]
impl AdapterFactory for BackendSelector {
    async fn create(&self, project_id: &ProjectId) -> Result<Arc<dyn SandboxAdapter>> {
        if self.config.remote.is_enabled() {
            match self.create_remote(project_id).await {
                Ok(adapter) => return Ok(adapter),
                Err(e) => {
                    let is_config = matches!(
                        e.downcast_ref::<SandboxError>(),
                        Some(SandboxError::Config { .. })
                    );
                    if is_config || self.config.remote.require {
                        return Err(e);
                    }
                    warn!(
                        project = %project_id,
                        error = %format!("{e:#}"),
                        "Remote sandbox unavailable, falling back to local backend"
                    );
                }
            }
        }

        let adapter = self.create_local(project_id).await?;
        info!(project = %project_id, root = %adapter.root(), "Created local sandbox");
        Ok(adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::BackendKind;
    use tempfile::tempdir;

    fn config_in(root: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.local.root = Some(root.display().to_string());
        config.shell.command = "sh".to_string();
        config
    }

    #[tokio::test]
    async fn test_local_when_no_endpoint() {
        let dir = tempdir().unwrap();
        let selector = BackendSelector::new(config_in(dir.path()));
        let id = ProjectId::parse("site").unwrap();

        let adapter = selector.create(&id).await.unwrap();
        assert_eq!(adapter.kind(), BackendKind::Local);
        assert!(std::path::Path::new(&adapter.root()).is_dir());
        adapter.dispose().await;
    }

    #[tokio::test]
    async fn test_unreachable_remote_falls_back_to_local() {
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.remote.endpoint = Some("tcp://127.0.0.1:1".to_string());
        let selector = BackendSelector::new(config);
        let id = ProjectId::parse("site").unwrap();

        let adapter = selector.create(&id).await.unwrap();
        assert_eq!(adapter.kind(), BackendKind::Local);
        adapter.dispose().await;
    }

    #[tokio::test]
    async fn test_required_remote_surfaces_provisioning_error() {
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.remote.endpoint = Some("tcp://127.0.0.1:1".to_string());
        config.remote.require = true;
        let selector = BackendSelector::new(config);
        let id = ProjectId::parse("site").unwrap();

        let err = selector.create(&id).await.err().unwrap();
        assert!(err.downcast_ref::<SandboxError>().unwrap().is_provisioning());
    }

    #[tokio::test]
    async fn test_bad_endpoint_is_a_config_error() {
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.remote.endpoint = Some("ftp://sandbox-host".to_string());
        let selector = BackendSelector::new(config);
        let id = ProjectId::parse("site").unwrap();

        let err = selector.create(&id).await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_init_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let selector = BackendSelector::new(config_in(&blocker));
        let id = ProjectId::parse("site").unwrap();

        assert!(selector.create(&id).await.is_err());
    }
}
