//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings. Adapter methods return
//! `anyhow::Result`; callers recover the typed error with
//! `err.downcast_ref::<SandboxError>()`.

/// Errors that can occur during sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// A required setting for the requested backend is missing or invalid.
    #[error("Sandbox configuration error: {message}")]
    Config { message: String },

    /// A synced file path is empty, absolute on a foreign root, or escapes the workspace.
    #[error("Invalid project file path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// Port forward requested for a port that cannot exist.
    #[error("Invalid port: {port}")]
    InvalidPort { port: u32 },

    /// Project id is unusable as a registry key.
    #[error("Invalid project id '{id}'")]
    InvalidProjectId { id: String },

    /// The remote provider could not provision a sandbox.
    #[error("Sandbox provisioning failed: {message}")]
    Provisioning { message: String },

    /// The backend cannot perform the requested operation.
    #[error("Unsupported by {backend} backend: {message}")]
    Unsupported {
        backend: &'static str,
        message: String,
    },

    /// The session was disposed before or during the operation.
    #[error("Session for project '{project_id}' is closed")]
    SessionClosed { project_id: String },
}

impl SandboxError {
    /// Creates a `Config` error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an `InvalidPath` error.
    pub fn invalid_path(path: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason,
        }
    }

    /// Creates an `InvalidPort` error.
    pub fn invalid_port(port: impl Into<u32>) -> Self {
        Self::InvalidPort { port: port.into() }
    }

    /// Creates an `InvalidProjectId` error.
    pub fn invalid_project_id(id: impl Into<String>) -> Self {
        Self::InvalidProjectId { id: id.into() }
    }

    /// Creates a `Provisioning` error.
    pub fn provisioning(message: impl Into<String>) -> Self {
        Self::Provisioning {
            message: message.into(),
        }
    }

    /// Creates an `Unsupported` error.
    pub fn unsupported(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Unsupported {
            backend,
            message: message.into(),
        }
    }

    /// Creates a `SessionClosed` error.
    pub fn session_closed(project_id: impl Into<String>) -> Self {
        Self::SessionClosed {
            project_id: project_id.into(),
        }
    }

    /// Returns true for errors raised by input validation, before any side effect.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidPath { .. } | Self::InvalidPort { .. } | Self::InvalidProjectId { .. }
        )
    }

    /// Returns true if this is a provisioning error.
    pub fn is_provisioning(&self) -> bool {
        matches!(self, Self::Provisioning { .. })
    }

    /// Returns true if the session was already closed.
    pub fn is_session_closed(&self) -> bool {
        matches!(self, Self::SessionClosed { .. })
    }
}
