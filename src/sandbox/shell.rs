//! Backend-neutral shell process handles.
//!
//! Adapters hand out a [`ShellHandle`]: byte streams for wiring plus a
//! [`ShellControl`] that owns the process lifecycle. Termination always
//! escalates: a graceful signal first, a forced kill once the grace period
//! runs out.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

/// Read buffer size for shell output.
const READ_CHUNK: usize = 8 * 1024;

/// One output stream of a shell process.
pub type OutputStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// How a shell process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ShellExit {
    /// The process exited or was killed by a signal.
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The process could not be waited on.
    Failed { message: String },
}

impl ShellExit {
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited { code, .. } => *code,
            Self::Failed { .. } => None,
        }
    }
}

impl From<ExitStatus> for ShellExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self::Exited {
            code: status.code(),
            signal,
        }
    }
}

/// Optional capability: not every backend can resize its shells.
#[async_trait]
pub trait ShellResize: Send + Sync {
    async fn resize(&self, size: TerminalSize) -> Result<()>;
}

/// A freshly spawned shell, ready to be wired to a terminal.
pub struct ShellHandle {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: OutputStream,
    pub stderr: Option<OutputStream>,
    pub resize: Option<Box<dyn ShellResize>>,
    pub control: ShellControl,
}

/// Lifecycle handle shared between the terminal and the adapter that spawned it.
#[derive(Clone)]
pub struct ShellControl {
    stop: Arc<Notify>,
    exit: watch::Receiver<Option<ShellExit>>,
}

/// Supervisor side of a [`ShellControl`].
pub(crate) struct ShellSupervisor {
    stop: Arc<Notify>,
    exit: watch::Sender<Option<ShellExit>>,
}

impl ShellControl {
    pub(crate) fn channel() -> (Self, ShellSupervisor) {
        let stop = Arc::new(Notify::new());
        let (tx, rx) = watch::channel(None);
        (
            Self {
                stop: Arc::clone(&stop),
                exit: rx,
            },
            ShellSupervisor { stop, exit: tx },
        )
    }

    /// Requests termination. Returns immediately; use [`ShellControl::wait`]
    /// to observe the exit.
    pub fn terminate(&self) {
        self.stop.notify_one();
    }

    pub fn exit_status(&self) -> Option<ShellExit> {
        self.exit.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Resolves once the process is gone.
    pub async fn wait(&self) -> ShellExit {
        let mut rx = self.exit.clone();
        if let Ok(exit) = rx.wait_for(Option::is_some).await {
            if let Some(exit) = exit.as_ref() {
                return exit.clone();
            }
        }
        ShellExit::Failed {
            message: "shell supervisor stopped without reporting an exit".to_string(),
        }
    }
}

impl ShellSupervisor {
    pub(crate) async fn stop_requested(&self) {
        self.stop.notified().await;
    }

    pub(crate) fn finish(self, exit: ShellExit) {
        self.exit.send_replace(Some(exit));
    }
}

/// Adapts an async reader into an [`OutputStream`]. The stream ends at EOF or
/// after the first read error.
pub(crate) fn reader_stream<R>(reader: R) -> OutputStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    stream::unfold(Some(reader), |state| async move {
        let Some(mut reader) = state else {
            return None;
        };
        let mut buf = vec![0u8; READ_CHUNK];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(reader)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

/// Watches a local child process until it exits or termination is requested.
pub(crate) fn supervise_child(mut child: Child, grace: Duration) -> ShellControl {
    let (control, supervisor) = ShellControl::channel();
    let pid = child.id();

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            () = supervisor.stop_requested() => terminate_child(&mut child, grace).await,
        };

        let exit = match status {
            Ok(status) => ShellExit::from(status),
            Err(e) => ShellExit::Failed {
                message: e.to_string(),
            },
        };
        debug!(?pid, ?exit, "Shell process finished");
        supervisor.finish(exit);
    });

    control
}

async fn terminate_child(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    if send_hangup(child) {
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        warn!(
            pid = ?child.id(),
            grace_ms = grace.as_millis(),
            "Shell ignored hangup, killing"
        );
    }
    child.kill().await?;
    child.wait().await
}

/// Sends SIGHUP, as a closing terminal would. Interactive shells ignore
/// SIGTERM but exit on hangup.
#[cfg(unix)]
fn send_hangup(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    kill(Pid::from_raw(pid), Signal::SIGHUP).is_ok()
}

#[cfg(not(unix))]
fn send_hangup(_child: &Child) -> bool {
    false
}

/// Live shells of one adapter, so disposal can reach every one of them.
#[derive(Default)]
pub(crate) struct ShellRegistry {
    shells: Mutex<Vec<ShellControl>>,
}

impl ShellRegistry {
    pub(crate) fn track(&self, control: &ShellControl) {
        let mut shells = self.shells.lock().unwrap_or_else(PoisonError::into_inner);
        shells.retain(|shell| !shell.has_exited());
        shells.push(control.clone());
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.shells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|shell| !shell.has_exited())
            .count()
    }

    /// Terminates every tracked shell and waits for them, bounded by twice
    /// the grace period.
    pub(crate) async fn terminate_all(&self, grace: Duration) {
        let shells = std::mem::take(&mut *self.shells.lock().unwrap_or_else(PoisonError::into_inner));
        if shells.is_empty() {
            return;
        }

        for shell in &shells {
            shell.terminate();
        }

        let waits = shells
            .iter()
            .map(|shell| tokio::time::timeout(grace * 2, shell.wait()));
        let lingering = join_all(waits)
            .await
            .into_iter()
            .filter(Result::is_err)
            .count();

        if lingering > 0 {
            warn!(lingering, "Some shells did not exit after termination");
        }
    }
}
