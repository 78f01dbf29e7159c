//! Remote sandbox backend on a Docker Engine endpoint.
//!
//! Each session gets its own long-lived container started from the
//! configured template image. Files are shipped as one tar upload, shells are
//! attached `docker exec` sessions, and port forwards resolve to the host
//! ports Docker published when the container was created.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, LogOutput,
    RemoveContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::service::HostConfig;
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::project::validate_files;
use super::shell::{OutputStream, ShellExit, ShellRegistry};
use super::{
    best_effort, BackendKind, PortForward, ProjectFile, ProjectId, SandboxAdapter, SandboxError,
    ShellControl, ShellHandle, ShellResize, TerminalSize,
};
use crate::config::{RemoteConfig, ShellConfig};

/// Seconds before a Docker API request is abandoned.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Tenths of a second to wait for a shell to record its pid.
const PID_FILE_POLLS: u32 = 30;

/// Buffered output chunks per shell before the reader applies backpressure.
const SHELL_OUTPUT_BUFFER: usize = 64;

/// Sandbox backed by a container on a Docker Engine.
pub(crate) struct DockerAdapter {
    project_id: ProjectId,
    docker: Docker,
    container: String,
    workdir: String,
    public_host: String,
    shell_argv: Vec<String>,
    kill_grace: Duration,
    preview_port: u16,
    shells: ShellRegistry,
    next_shell: AtomicU64,
}

impl DockerAdapter {
    /// Connects to the endpoint and creates + starts the sandbox container.
    ///
    /// Any failure after the endpoint is known is a provisioning error; a
    /// container that was created but failed to start is removed again.
    pub async fn provision(
        project_id: &ProjectId,
        remote: &RemoteConfig,
        shell: &ShellConfig,
        preview_port: u16,
    ) -> Result<Self> {
        let endpoint = remote
            .endpoint
            .as_deref()
            .filter(|endpoint| !endpoint.trim().is_empty())
            .ok_or_else(|| SandboxError::config("remote.endpoint is not set"))?;
        let shell_argv = shell.argv()?;

        let docker = connect(endpoint)?;
        docker.ping().await.map_err(|e| {
            SandboxError::provisioning(format!("Docker endpoint {endpoint} is unreachable: {e}"))
        })?;

        ensure_image(&docker, &remote.template).await?;

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let container = format!("sandman-{}-{}", project_id.slug(), &suffix[..8]);
        let ports = published_ports(preview_port, &remote.exposed_ports);

        let config = ContainerConfig {
            image: Some(remote.template.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(remote.workdir.clone()),
            exposed_ports: Some(
                ports
                    .iter()
                    .map(|port| (format!("{port}/tcp"), HashMap::new()))
                    .collect(),
            ),
            labels: Some(HashMap::from([(
                "sandman.project".to_string(),
                project_id.slug().to_string(),
            )])),
            host_config: Some(HostConfig {
                publish_all_ports: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        debug!("Creating container: {}", container);
        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| SandboxError::provisioning(format!("failed to create container: {e}")))?;

        if let Err(e) = docker.start_container::<String>(&container, None).await {
            remove_container(&docker, &container).await;
            return Err(
                SandboxError::provisioning(format!("failed to start container: {e}")).into(),
            );
        }

        info!(
            project = %project_id,
            container = %container,
            image = %remote.template,
            ?ports,
            "Provisioned Docker sandbox"
        );

        Ok(Self {
            project_id: project_id.clone(),
            docker,
            container,
            workdir: remote.workdir.clone(),
            public_host: public_host(endpoint),
            shell_argv,
            kill_grace: shell.kill_grace(),
            preview_port,
            shells: ShellRegistry::default(),
            next_shell: AtomicU64::new(1),
        })
    }

    /// Starts `command` through a wrapper that records its pid, so
    /// termination can signal it from a separate exec.
    async fn start_exec(&self, command: &str, tty: bool) -> Result<ShellHandle> {
        let shell_id = self.next_shell.fetch_add(1, Ordering::Relaxed);
        let pid_file = format!("/tmp/.sandman-shell-{shell_id}.pid");
        let script = format!("echo $$ > {pid_file}; exec {command}");
        let term = if tty { "xterm-256color" } else { "dumb" };

        let exec = self
            .docker
            .create_exec(
                &self.container,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), script]),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(tty),
                    working_dir: Some(self.workdir.clone()),
                    env: Some(vec![format!("TERM={term}")]),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create shell exec")?;

        let StartExecResults::Attached { output, input } = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty,
                    ..Default::default()
                }),
            )
            .await
            .context("Failed to start shell exec")?
        else {
            bail!("Shell exec started detached");
        };

        debug!(project = %self.project_id, exec = %exec.id, "Attached Docker shell");

        let (tx, mut rx) = mpsc::channel(SHELL_OUTPUT_BUFFER);
        let (control, supervisor) = ShellControl::channel();
        let docker = self.docker.clone();
        let container = self.container.clone();
        let exec_id = exec.id.clone();
        let grace = self.kill_grace;

        tokio::spawn(async move {
            let mut output = output;
            let mut terminating = false;
            loop {
                tokio::select! {
                    chunk = output.next() => match chunk {
                        Some(chunk) => {
                            let chunk = chunk.map(LogOutput::into_bytes).map_err(std::io::Error::other);
                            // A dropped reader just means nobody is watching
                            let _ = tx.send(chunk).await;
                        }
                        None => break,
                    },
                    () = supervisor.stop_requested(), if !terminating => {
                        terminating = true;
                        tokio::spawn(terminate_in_container(
                            docker.clone(),
                            container.clone(),
                            pid_file.clone(),
                            grace,
                        ));
                    }
                }
            }
            drop(tx);

            let exit = match docker.inspect_exec(&exec_id).await {
                Ok(inspect) => ShellExit::Exited {
                    code: inspect.exit_code.and_then(|code| i32::try_from(code).ok()),
                    signal: None,
                },
                Err(e) => ShellExit::Failed {
                    message: e.to_string(),
                },
            };
            supervisor.finish(exit);
        });

        self.shells.track(&control);

        let stdout: OutputStream =
            futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed();

        Ok(ShellHandle {
            stdin: Box::new(input),
            stdout,
            stderr: None,
            resize: tty.then(|| {
                Box::new(DockerResize {
                    docker: self.docker.clone(),
                    exec_id: exec.id,
                }) as Box<dyn ShellResize>
            }),
            control,
        })
    }
}

#[async_trait]
impl SandboxAdapter for DockerAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    fn root(&self) -> String {
        format!("{}:{}", self.container, self.workdir)
    }

    fn default_preview_port(&self) -> u16 {
        self.preview_port
    }

    async fn init(&self) -> Result<()> {
        run_exec(
            &self.docker,
            &self.container,
            vec!["mkdir".to_string(), "-p".to_string(), self.workdir.clone()],
        )
        .await
        .context("Failed to prepare container workspace")
    }

    async fn sync_project(&self, files: &[ProjectFile]) -> Result<()> {
        let validated = validate_files(files)?;
        let archive = build_archive(&validated)?;

        let workdir = shell_words::quote(&self.workdir);
        run_exec(
            &self.docker,
            &self.container,
            vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("mkdir -p {workdir} && find {workdir} -mindepth 1 -delete"),
            ],
        )
        .await
        .context("Failed to clear container workspace")?;

        self.docker
            .upload_to_container(
                &self.container,
                Some(UploadToContainerOptions {
                    path: self.workdir.clone(),
                    ..Default::default()
                }),
                archive,
            )
            .await
            .context("Failed to upload project archive")?;

        info!(
            project = %self.project_id,
            files = files.len(),
            "Synced project into Docker sandbox"
        );
        Ok(())
    }

    async fn spawn_shell(&self) -> Result<ShellHandle> {
        self.start_exec(&shell_words::join(&self.shell_argv), true).await
    }

    async fn spawn_command(&self, command: &str) -> Result<ShellHandle> {
        self.start_exec(command, false).await
    }

    async fn open_port_forward(&self, port: u16) -> Result<PortForward> {
        if port == 0 {
            return Err(SandboxError::invalid_port(port).into());
        }

        let info = self
            .docker
            .inspect_container(&self.container, None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect sandbox container")?;

        let key = format!("{port}/tcp");
        let host_port = info
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|ports| ports.get(&key).cloned().flatten())
            .and_then(|bindings| {
                bindings
                    .into_iter()
                    .filter_map(|binding| binding.host_port)
                    .find_map(|host_port| host_port.parse::<u16>().ok())
            })
            .ok_or_else(|| {
                SandboxError::unsupported(
                    "docker",
                    format!("port {port} is not published by the sandbox container"),
                )
            })?;

        debug!(project = %self.project_id, port, host_port, "Resolved published port");
        Ok(PortForward {
            remote_port: port,
            local_port: host_port,
            url: format!("http://{}:{host_port}", self.public_host),
        })
    }

    async fn close_port_forward(&self, forward: &PortForward) -> Result<()> {
        // Published ports live as long as the container
        debug!(
            project = %self.project_id,
            port = forward.remote_port,
            "Released Docker port forward"
        );
        Ok(())
    }

    async fn dispose(&self) {
        self.shells.terminate_all(self.kill_grace).await;
        remove_container(&self.docker, &self.container).await;
        info!(project = %self.project_id, container = %self.container, "Disposed Docker sandbox");
    }
}

struct DockerResize {
    docker: Docker,
    exec_id: String,
}

#[async_trait]
impl ShellResize for DockerResize {
    async fn resize(&self, size: TerminalSize) -> Result<()> {
        self.docker
            .resize_exec(
                &self.exec_id,
                ResizeExecOptions {
                    height: size.rows,
                    width: size.cols,
                },
            )
            .await
            .context("Failed to resize shell")
    }
}

/// Connects to "local", "unix://…", "tcp://…" or "http://…" endpoints.
fn connect(endpoint: &str) -> Result<Docker, SandboxError> {
    let result = if endpoint == "local" {
        Docker::connect_with_local_defaults()
    } else if endpoint.starts_with("unix://") {
        Docker::connect_with_unix(endpoint, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
    } else if endpoint.starts_with("tcp://") || endpoint.starts_with("http://") {
        Docker::connect_with_http(endpoint, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
    } else {
        return Err(SandboxError::config(format!(
            "unsupported remote endpoint '{endpoint}' (expected local, unix://, tcp:// or http://)"
        )));
    };

    result.map_err(|e| SandboxError::provisioning(format!("cannot connect to {endpoint}: {e}")))
}

/// Pulls the template image unless it is already present.
async fn ensure_image(docker: &Docker, image: &str) -> Result<(), SandboxError> {
    if docker.inspect_image(image).await.is_ok() {
        return Ok(());
    }

    info!("Pulling sandbox template image: {}", image);
    let mut stream = docker.create_image(
        Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        }),
        None,
        None,
    );

    while let Some(progress) = stream.next().await {
        match progress {
            Ok(info) => {
                if let Some(error) = info.error {
                    return Err(SandboxError::provisioning(format!(
                        "failed to pull {image}: {error}"
                    )));
                }
            }
            Err(e) => {
                return Err(SandboxError::provisioning(format!(
                    "failed to pull {image}: {e}"
                )));
            }
        }
    }
    Ok(())
}

/// Runs a command to completion inside the container; a non-zero exit is an error.
async fn run_exec(docker: &Docker, container: &str, cmd: Vec<String>) -> Result<()> {
    let display = cmd.join(" ");
    let exec = docker
        .create_exec(
            container,
            CreateExecOptions {
                cmd: Some(cmd),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("Failed to create exec `{display}`"))?;

    let mut output = String::new();
    if let StartExecResults::Attached {
        output: mut stream, ..
    } = docker
        .start_exec(&exec.id, None)
        .await
        .with_context(|| format!("Failed to start exec `{display}`"))?
    {
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => output.push_str(&String::from_utf8_lossy(&log.into_bytes())),
                Err(e) => warn!("Error reading exec output: {}", e),
            }
        }
    }

    let inspect = docker
        .inspect_exec(&exec.id)
        .await
        .with_context(|| format!("Failed to inspect exec `{display}`"))?;
    match inspect.exit_code {
        Some(0) | None => Ok(()),
        Some(code) => bail!("`{display}` exited with {code}: {}", output.trim()),
    }
}

/// Shell snippet sending `signal` to the process recorded in `pid_file`.
///
/// A shell disposed right after it started may not have written its pid yet,
/// so the snippet polls for the file before giving up.
fn signal_script(pid_file: &str, signal: &str) -> String {
    format!(
        "i=0; while [ ! -s {pid_file} ] && [ $i -lt {PID_FILE_POLLS} ]; do sleep 0.1; i=$((i+1)); done; \
         kill -{signal} \"$(cat {pid_file} 2>/dev/null)\" 2>/dev/null || true"
    )
}

/// Hangs up the shell recorded in `pid_file`, then kills it after `grace`.
async fn terminate_in_container(
    docker: Docker,
    container: String,
    pid_file: String,
    grace: Duration,
) {
    let signal = |name: &str| {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            signal_script(&pid_file, name),
        ]
    };

    best_effort(
        "hang up container shell",
        run_exec(&docker, &container, signal("HUP")),
    )
    .await;
    tokio::time::sleep(grace).await;
    best_effort(
        "kill container shell",
        run_exec(&docker, &container, signal("KILL")),
    )
    .await;
}

async fn remove_container(docker: &Docker, container: &str) {
    best_effort("remove sandbox container", async {
        docker
            .remove_container(
                container,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("Failed to remove container {container}"))
    })
    .await;
}

/// Packs validated project files into a tar archive for upload.
fn build_archive(files: &[(PathBuf, &str)]) -> Result<Bytes> {
    let mtime = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
    let mut builder = tar::Builder::new(Vec::new());

    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        builder
            .append_data(&mut header, path, content.as_bytes())
            .with_context(|| format!("Failed to archive {}", path.display()))?;
    }

    let archive = builder.into_inner().context("Failed to finalize archive")?;
    Ok(Bytes::from(archive))
}

/// Host that published ports are reachable on.
fn public_host(endpoint: &str) -> String {
    let Some(rest) = endpoint
        .strip_prefix("tcp://")
        .or_else(|| endpoint.strip_prefix("http://"))
    else {
        return "localhost".to_string();
    };

    let authority = rest.split('/').next().unwrap_or(rest);
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    };

    if host.is_empty() {
        "localhost".to_string()
    } else {
        host.to_string()
    }
}

/// Ports the container publishes: the preview port plus configured extras.
fn published_ports(preview_port: u16, extra: &[u16]) -> Vec<u16> {
    let mut ports: Vec<u16> = std::iter::once(preview_port)
        .chain(extra.iter().copied())
        .filter(|port| *port != 0)
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_public_host() {
        assert_eq!(public_host("tcp://10.0.0.5:2375"), "10.0.0.5");
        assert_eq!(public_host("http://docker.internal:2375/"), "docker.internal");
        assert_eq!(public_host("tcp://sandbox-host"), "sandbox-host");
        assert_eq!(public_host("unix:///var/run/docker.sock"), "localhost");
        assert_eq!(public_host("local"), "localhost");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signal_script_waits_for_late_pid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("shell.pid").display().to_string();

        // The wrapper records its pid only after a delay
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(format!("sleep 0.5; echo $$ > {pid_file}; exec sleep 30"))
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(signal_script(&pid_file, "KILL"))
            .status()
            .await
            .unwrap();
        assert!(status.success());

        let exited = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("shell survived the signal")
            .unwrap();
        assert!(!exited.success());
    }

    #[tokio::test]
    async fn test_signal_script_gives_up_without_pid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("missing.pid").display().to_string();

        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(signal_script(&pid_file, "HUP"))
            .status()
            .await
            .unwrap();
        assert!(status.success());
    }

    #[test]
    fn test_published_ports_dedup_and_sort() {
        assert_eq!(published_ports(4173, &[3000, 4173, 0]), vec![3000, 4173]);
        assert_eq!(published_ports(4173, &[]), vec![4173]);
    }

    #[test]
    fn test_build_archive_contains_files() {
        let files = vec![
            (PathBuf::from("index.html"), "<h1>hi</h1>"),
            (PathBuf::from("src/main.ts"), "console.log(1)"),
        ];
        let archive = build_archive(&files).unwrap();

        let mut tar = tar::Archive::new(archive.as_ref());
        let mut seen = Vec::new();
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().into_owned();
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            seen.push((path, content));
        }

        assert_eq!(
            seen,
            vec![
                (PathBuf::from("index.html"), "<h1>hi</h1>".to_string()),
                (PathBuf::from("src/main.ts"), "console.log(1)".to_string()),
            ]
        );
    }

    #[test]
    fn test_connect_rejects_unknown_scheme() {
        let err = connect("ftp://example.com").unwrap_err();
        assert!(matches!(err, SandboxError::Config { .. }));
    }

    #[tokio::test]
    async fn test_provision_unreachable_endpoint_is_provisioning_error() {
        let remote = RemoteConfig {
            endpoint: Some("tcp://127.0.0.1:1".to_string()),
            ..RemoteConfig::default()
        };
        let id = ProjectId::parse("demo").unwrap();
        let err = DockerAdapter::provision(&id, &remote, &ShellConfig::default(), 4173)
            .await
            .err()
            .expect("provisioning should fail");
        let typed = err.downcast_ref::<SandboxError>().unwrap();
        assert!(typed.is_provisioning());
    }

    #[tokio::test]
    async fn test_provision_without_endpoint_is_config_error() {
        let id = ProjectId::parse("demo").unwrap();
        let err = DockerAdapter::provision(
            &id,
            &RemoteConfig::default(),
            &ShellConfig::default(),
            4173,
        )
        .await
        .err()
        .expect("provisioning should fail");
        assert!(matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::Config { .. })
        ));
    }
}
