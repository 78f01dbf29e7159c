//! Sandbox backends for per-project workspaces.
//!
//! A [`SandboxAdapter`] owns one provisioned environment: a workspace that
//! mirrors a project's files, the shells running in it, and the port
//! forwards that make its dev server reachable. Two backends exist:
//! - `local`: a scratch directory and plain subprocesses on this host
//! - `docker`: a container on a (possibly remote) Docker Engine
//!
//! The backend is picked per session by the [`AdapterFactory`].

mod cleanup;
mod docker;
mod error;
mod factory;
mod local;
#[cfg(test)]
pub(crate) mod mock;
mod project;
mod shell;

pub(crate) use cleanup::best_effort;
pub(crate) use docker::DockerAdapter;
pub use error::SandboxError;
pub use factory::{AdapterFactory, BackendSelector};
pub(crate) use local::LocalAdapter;
pub use project::{ProjectFile, ProjectId};
pub use shell::{OutputStream, ShellControl, ShellExit, ShellHandle, ShellResize, TerminalSize};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

/// Which backend a sandbox runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Scratch directory and subprocesses on this host.
    Local,
    /// Container on a Docker Engine endpoint.
    Docker,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

/// A port inside the workspace made reachable from this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortForward {
    pub remote_port: u16,
    pub local_port: u16,
    pub url: String,
}

/// Capability set every sandbox backend implements.
#[async_trait]
pub trait SandboxAdapter: Send + Sync {
    /// Backend this adapter runs on.
    fn kind(&self) -> BackendKind;

    /// Workspace root, for display: a host directory or a container path.
    fn root(&self) -> String;

    /// Port the project's dev server is expected to listen on.
    fn default_preview_port(&self) -> u16;

    /// Prepares the workspace. Idempotent.
    async fn init(&self) -> Result<()>;

    /// Replaces the workspace content with exactly `files`.
    ///
    /// All paths are validated before anything is deleted or written.
    async fn sync_project(&self, files: &[ProjectFile]) -> Result<()>;

    /// Starts an interactive shell rooted in the workspace.
    async fn spawn_shell(&self) -> Result<ShellHandle>;

    /// Runs `command` with `sh -c` in the workspace, without a tty or an
    /// interactive shell. Exits when the command does.
    async fn spawn_command(&self, command: &str) -> Result<ShellHandle>;

    /// Makes `port` inside the workspace reachable from this host.
    async fn open_port_forward(&self, port: u16) -> Result<PortForward>;

    /// Tears down a forward opened by [`SandboxAdapter::open_port_forward`]. Idempotent.
    async fn close_port_forward(&self, forward: &PortForward) -> Result<()>;

    /// Terminates every shell and releases the workspace. Never fails:
    /// cleanup problems are logged.
    async fn dispose(&self);
}
