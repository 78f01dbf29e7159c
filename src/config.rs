use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sandbox::SandboxError;

/// Config file looked up in the current directory.
pub const CONFIG_FILE: &str = "sandman.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerSettings,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Session registry and idle reclamation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSettings {
    /// Sessions with no connections are reclaimed after this many idle seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// How often the idle sweep runs (defaults to the idle timeout)
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,

    /// Port a generated app is expected to serve its preview on
    #[serde(default = "default_preview_port")]
    pub default_preview_port: u16,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: None,
            default_preview_port: default_preview_port(),
        }
    }
}

impl ManagerSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval_secs
            .map_or_else(|| self.idle_timeout(), Duration::from_secs)
    }
}

/// Interactive shell settings shared by all backends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Shell command line, split with POSIX shell quoting rules
    /// - Default: "sh -i"
    /// - Examples: "bash --login", "/bin/zsh -i"
    #[serde(default = "default_shell_command")]
    pub command: String,

    /// Milliseconds between the graceful hangup and the forced kill
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            command: default_shell_command(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

impl ShellConfig {
    /// Parses the command line into program and arguments.
    pub fn argv(&self) -> Result<Vec<String>, SandboxError> {
        let argv = shell_words::split(&self.command).map_err(|e| {
            SandboxError::config(format!("invalid shell command '{}': {e}", self.command))
        })?;
        if argv.is_empty() {
            return Err(SandboxError::config("shell command is empty"));
        }
        Ok(argv)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Local subprocess backend settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Parent directory for per-project workspaces (defaults to the system temp dir)
    #[serde(default)]
    pub root: Option<String>,
}

impl LocalConfig {
    /// Resolves the workspace parent directory, expanding `~/`.
    pub fn root_dir(&self) -> Result<PathBuf> {
        match self.root.as_deref() {
            Some(root) if !root.trim().is_empty() => Ok(PathBuf::from(expand_path(root)?)),
            _ => Ok(std::env::temp_dir()),
        }
    }
}

/// Remote sandbox provider settings (a Docker Engine endpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Docker endpoint: "local", "unix:///path/docker.sock" or "tcp://host:2375".
    /// Leaving it unset selects the local backend.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Container image every sandbox starts from
    #[serde(default = "default_template")]
    pub template: String,

    /// Workspace directory inside the container
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Extra container ports to publish besides the default preview port
    #[serde(default)]
    pub exposed_ports: Vec<u16>,

    /// Fail session creation instead of falling back to the local backend
    #[serde(default)]
    pub require: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            template: default_template(),
            workdir: default_workdir(),
            exposed_ports: Vec::new(),
            require: false,
        }
    }
}

impl RemoteConfig {
    /// Whether a remote provider is configured at all.
    pub fn is_enabled(&self) -> bool {
        self.endpoint
            .as_deref()
            .is_some_and(|endpoint| !endpoint.trim().is_empty())
    }
}

// Default value functions
fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_preview_port() -> u16 {
    4173
}

fn default_shell_command() -> String {
    "sh -i".to_string()
}

fn default_kill_grace_ms() -> u64 {
    1000
}

fn default_template() -> String {
    "node:20-bookworm-slim".to_string()
}

fn default_workdir() -> String {
    "/workspace".to_string()
}

impl Config {
    /// Load configuration from file, using defaults if not found
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }

    /// Applies command-line and environment overrides resolved at startup.
    pub fn with_overrides(
        mut self,
        remote_endpoint: Option<String>,
        remote_template: Option<String>,
        shell: Option<String>,
    ) -> Self {
        if let Some(endpoint) = remote_endpoint {
            self.remote.endpoint = Some(endpoint);
        }
        if let Some(template) = remote_template {
            self.remote.template = template;
        }
        if let Some(shell) = shell {
            self.shell.command = shell;
        }
        self
    }
}

/// Expand ~ to home directory
fn expand_path(path: &str) -> Result<String> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(rest).display().to_string())
    } else {
        Ok(path.to_string())
    }
}
