//! Local subprocess backend.
//!
//! The workspace is a scratch directory under the configured root (the
//! system temp dir by default). Shells are plain child processes with piped
//! stdio, and the host network is the sandbox network, so port forwards are
//! the identity mapping.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::future::try_join_all;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

use super::project::validate_files;
use super::shell::{reader_stream, supervise_child, ShellRegistry};
use super::{
    best_effort, BackendKind, PortForward, ProjectFile, ProjectId, SandboxAdapter, SandboxError,
    ShellHandle,
};
use crate::config::ShellConfig;

/// Sandbox backed by a host directory and local processes.
pub(crate) struct LocalAdapter {
    project_id: ProjectId,
    root: PathBuf,
    shell_argv: Vec<String>,
    kill_grace: Duration,
    preview_port: u16,
    shells: ShellRegistry,
}

impl LocalAdapter {
    /// Creates an adapter whose workspace lives under `parent`.
    ///
    /// The directory name combines the sanitized project slug with a random
    /// suffix, so ids that sanitize to the same slug never share a workspace.
    pub fn new(
        project_id: &ProjectId,
        parent: &Path,
        shell: &ShellConfig,
        preview_port: u16,
    ) -> Result<Self, SandboxError> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let root = parent.join(format!("sandman-{}-{}", project_id.slug(), &suffix[..8]));

        Ok(Self {
            project_id: project_id.clone(),
            root,
            shell_argv: shell.argv()?,
            kill_grace: shell.kill_grace(),
            preview_port,
            shells: ShellRegistry::default(),
        })
    }

    /// Host directory holding the workspace.
    pub fn root_path(&self) -> &Path {
        &self.root
    }

    fn spawn_process(&self, argv: &[String]) -> Result<ShellHandle> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SandboxError::config("shell command is empty"))?;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&self.root)
            .env("TERM", "dumb")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to spawn shell '{}' in {}",
                    program,
                    self.root.display()
                )
            })?;

        let stdin = child.stdin.take().context("Shell stdin was not captured")?;
        let stdout = child.stdout.take().context("Shell stdout was not captured")?;
        let stderr = child.stderr.take().context("Shell stderr was not captured")?;

        debug!(project = %self.project_id, pid = ?child.id(), "Spawned local shell");

        let control = supervise_child(child, self.kill_grace);
        self.shells.track(&control);

        Ok(ShellHandle {
            stdin: Box::new(stdin),
            stdout: reader_stream(stdout),
            stderr: Some(reader_stream(stderr)),
            resize: None,
            control,
        })
    }
}

#[async_trait]
impl SandboxAdapter for LocalAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn root(&self) -> String {
        self.root_path().display().to_string()
    }

    fn default_preview_port(&self) -> u16 {
        self.preview_port
    }

    async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create workspace: {}", self.root.display()))?;
        debug!(project = %self.project_id, root = %self.root.display(), "Local workspace ready");
        Ok(())
    }

    async fn sync_project(&self, files: &[ProjectFile]) -> Result<()> {
        let validated = validate_files(files)?;

        reset_dir(&self.root).await?;

        let writes = validated.into_iter().map(|(relative, content)| {
            let path = self.root.join(relative);
            async move {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await.with_context(|| {
                        format!("Failed to create directory: {}", parent.display())
                    })?;
                }
                fs::write(&path, content)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))
            }
        });
        try_join_all(writes).await?;

        info!(
            project = %self.project_id,
            files = files.len(),
            "Synced project into local workspace"
        );
        Ok(())
    }

    async fn spawn_shell(&self) -> Result<ShellHandle> {
        self.spawn_process(&self.shell_argv)
    }

    async fn spawn_command(&self, command: &str) -> Result<ShellHandle> {
        self.spawn_process(&["sh".to_string(), "-c".to_string(), command.to_string()])
    }

    async fn open_port_forward(&self, port: u16) -> Result<PortForward> {
        if port == 0 {
            return Err(SandboxError::invalid_port(port).into());
        }
        Ok(PortForward {
            remote_port: port,
            local_port: port,
            url: format!("http://localhost:{port}"),
        })
    }

    async fn close_port_forward(&self, _forward: &PortForward) -> Result<()> {
        // Identity forwards hold no resources
        Ok(())
    }

    async fn dispose(&self) {
        self.shells.terminate_all(self.kill_grace).await;

        best_effort("remove local workspace", async {
            match fs::remove_dir_all(&self.root).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| {
                    format!("Failed to remove workspace: {}", self.root.display())
                }),
            }
        })
        .await;

        info!(project = %self.project_id, root = %self.root.display(), "Disposed local sandbox");
    }
}

/// Empties `dir`, creating it if needed.
async fn reset_dir(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to clear workspace: {}", dir.display()));
        }
    }
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create workspace: {}", dir.display()))
}
