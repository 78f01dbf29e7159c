//! CLI command implementations.
//!
//! Each command runs against a [`SessionManager`] built from the loaded
//! configuration and shuts it down before returning, so no sandbox outlives
//! the command.

pub mod exec;
pub mod init;
pub mod preview;
pub mod shell;
mod workspace;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::manager::{ManagerConfig, SessionManager};
use crate::sandbox::BackendSelector;
use crate::session::{ConnectionGuard, Session};

/// The project a command operates on.
#[derive(Debug, Clone)]
pub(crate) struct ProjectArgs {
    pub dir: PathBuf,
    pub project_id: Option<String>,
}

/// A synced, connected session for one command invocation.
pub(crate) struct OpenProject {
    pub session: Arc<Session>,
    pub connection: ConnectionGuard,
}

/// Session manager over the configured backends.
pub(crate) fn start_manager(config: &Config) -> SessionManager {
    SessionManager::new(
        ManagerConfig::from(&config.manager),
        Arc::new(BackendSelector::new(config.clone())),
    )
}

/// Reads the project directory, then creates, connects and syncs its session.
pub(crate) async fn open_project(
    manager: &SessionManager,
    project: &ProjectArgs,
) -> Result<OpenProject> {
    let files = workspace::read_project_files(&project.dir)?;
    let project_id = project
        .project_id
        .clone()
        .unwrap_or_else(|| workspace::default_project_id(&project.dir));

    let session = manager
        .ensure_session(&project_id)
        .await
        .with_context(|| format!("Failed to start sandbox for '{project_id}'"))?;
    let connection = session.acquire_connection()?;
    session
        .sync_project(&files)
        .await
        .with_context(|| format!("Failed to sync {}", display_dir(&project.dir)))?;

    info!(
        project = %project_id,
        backend = %session.adapter().kind(),
        files = files.len(),
        "Project synced"
    );
    Ok(OpenProject {
        session,
        connection,
    })
}

fn display_dir(dir: &Path) -> String {
    dir.canonicalize()
        .unwrap_or_else(|_| dir.to_path_buf())
        .display()
        .to_string()
}
