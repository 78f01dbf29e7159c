//! Interactive terminals over sandbox shells.
//!
//! A [`Terminal`] wraps one [`ShellHandle`]. stdout and stderr are pumped
//! into a single broadcast channel, input goes straight to the shell's stdin,
//! and the terminal closes (for good) when the process exits or is disposed.

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::future::join_all;
use futures_util::StreamExt;
use serde::Serialize;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::sandbox::{ShellControl, ShellExit, ShellHandle, ShellResize, TerminalSize};

/// Output chunks a slow subscriber may fall behind before it starts losing data.
const OUTPUT_CAPACITY: usize = 1024;

static NEXT_TERMINAL_ID: AtomicU64 = AtomicU64::new(1);

/// How a terminal's process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TerminalExit {
    /// The process ended on its own or by signal.
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The exit could not be observed.
    Error { message: String },
}

impl TerminalExit {
    /// Exit code, when the process exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited { code, .. } => *code,
            Self::Error { .. } => None,
        }
    }
}

impl From<ShellExit> for TerminalExit {
    fn from(exit: ShellExit) -> Self {
        match exit {
            ShellExit::Exited { code, signal } => Self::Exited { code, signal },
            ShellExit::Failed { message } => Self::Error { message },
        }
    }
}

/// A live shell session. Cheap to clone; all clones drive the same process.
#[derive(Clone)]
pub struct Terminal {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    closed: AtomicBool,
    disposed: AtomicBool,
    stdin: tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    resize: Option<Box<dyn ShellResize>>,
    control: ShellControl,
    output: Mutex<Option<broadcast::Sender<Bytes>>>,
    exit: watch::Receiver<Option<TerminalExit>>,
}

impl Terminal {
    /// Wraps a spawned shell and starts pumping its output.
    pub fn new(handle: ShellHandle) -> Self {
        Self::with_output(handle).0
    }

    /// Like [`Terminal::new`], plus a receiver subscribed before any output
    /// is pumped, for processes that start producing output right away.
    pub fn with_output(handle: ShellHandle) -> (Self, broadcast::Receiver<Bytes>) {
        let ShellHandle {
            stdin,
            stdout,
            stderr,
            resize,
            control,
        } = handle;

        let id = NEXT_TERMINAL_ID.fetch_add(1, Ordering::Relaxed);
        let (output_tx, first_rx) = broadcast::channel(OUTPUT_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);

        let mut pumps = vec![tokio::spawn(pump(id, stdout, output_tx.clone()))];
        if let Some(stderr) = stderr {
            pumps.push(tokio::spawn(pump(id, stderr, output_tx.clone())));
        }

        let inner = Arc::new(Inner {
            id,
            closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            resize,
            control: control.clone(),
            output: Mutex::new(Some(output_tx)),
            exit: exit_rx,
        });

        // Subscribers see the end of output once both pumps are drained
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            join_all(pumps).await;
            if let Some(inner) = weak.upgrade() {
                inner
                    .output
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
            }
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let exit = TerminalExit::from(control.wait().await);
            if let Some(inner) = weak.upgrade() {
                inner.closed.store(true, Ordering::SeqCst);
            }
            debug!(terminal = id, ?exit, "Terminal closed");
            exit_tx.send_replace(Some(exit));
        });

        (Self { inner }, first_rx)
    }

    /// Process-wide unique id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether the process exited or the terminal was disposed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Merged stdout/stderr from now on. The receiver reports `Closed` once
    /// the process is gone and its output is drained.
    pub fn subscribe_output(&self) -> broadcast::Receiver<Bytes> {
        match self
            .inner
            .output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Forwards input to the shell. Writing to a closed terminal is a no-op,
    /// and so is writing to a process that has just gone away.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        let mut stdin = self.inner.stdin.lock().await;
        let Some(writer) = stdin.as_mut() else {
            return Ok(());
        };

        let result = async {
            writer.write_all(data).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                debug!(terminal = self.inner.id, "Shell input closed, dropping write");
                stdin.take();
                Ok(())
            }
            Err(e) => Err(e).context("Failed to write to terminal"),
        }
    }

    /// Resizes the shell's terminal when the backend supports it.
    pub async fn resize(&self, size: TerminalSize) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        match &self.inner.resize {
            Some(resize) => resize.resize(size).await,
            None => Ok(()),
        }
    }

    /// Closes the terminal and asks the shell to terminate. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.stdin.lock().await.take();
        self.inner.control.terminate();
        debug!(terminal = self.inner.id, "Terminal disposed");
    }

    /// Exit status, if the process has ended.
    pub fn exit_status(&self) -> Option<TerminalExit> {
        self.inner.exit.borrow().clone()
    }

    /// Resolves once with the process exit; every caller sees the same value.
    pub async fn wait(&self) -> TerminalExit {
        let mut rx = self.inner.exit.clone();
        if let Ok(exit) = rx.wait_for(Option::is_some).await {
            if let Some(exit) = exit.as_ref() {
                return exit.clone();
            }
        }
        TerminalExit::Error {
            message: "terminal watcher stopped without reporting an exit".to_string(),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::SeqCst) {
            self.control.terminate();
        }
    }
}

async fn pump(
    terminal: u64,
    mut stream: crate::sandbox::OutputStream,
    output: broadcast::Sender<Bytes>,
) {
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                // No subscribers is not an error
                let _ = output.send(bytes);
            }
            Err(e) => {
                debug!(terminal, error = %e, "Terminal output stream failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mock::MockAdapter;
    use crate::sandbox::SandboxAdapter;
    use std::time::Duration;
    use tokio::sync::broadcast::error::RecvError;

    async fn terminal() -> (MockAdapter, Terminal) {
        let adapter = MockAdapter::new("demo");
        let shell = adapter.spawn_shell().await.unwrap();
        (adapter, Terminal::new(shell))
    }

    #[tokio::test]
    async fn test_output_reaches_subscribers() {
        let (_adapter, terminal) = terminal().await;
        let mut output = terminal.subscribe_output();

        terminal.write(b"echo me").await.unwrap();
        let chunk = output.recv().await.unwrap();
        assert_eq!(&chunk[..], b"echo me");
        assert!(!terminal.is_closed());
    }

    #[tokio::test]
    async fn test_exit_closes_terminal_and_output() {
        let (_adapter, terminal) = terminal().await;
        let mut output = terminal.subscribe_output();

        terminal.write(b"exit\n").await.unwrap();
        let exit = terminal.wait().await;
        assert_eq!(exit.code(), Some(0));
        assert!(terminal.is_closed());

        let end = tokio::time::timeout(Duration::from_secs(2), output.recv())
            .await
            .unwrap();
        assert!(matches!(end, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn test_write_after_exit_is_noop() {
        let (_adapter, terminal) = terminal().await;
        terminal.write(b"exit\n").await.unwrap();
        terminal.wait().await;

        terminal.write(b"still there?").await.unwrap();
        terminal.write(b"").await.unwrap();
    }

    #[tokio::test]
    async fn test_observers_see_exit_once() {
        let (_adapter, terminal) = terminal().await;
        let first = terminal.clone();
        let second = terminal.clone();
        let waiters = tokio::spawn(async move { (first.wait().await, second.wait().await) });

        terminal.dispose().await;
        let (a, b) = waiters.await.unwrap();
        assert_eq!(a, b);
        assert_eq!(terminal.exit_status(), Some(a));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (_adapter, terminal) = terminal().await;
        terminal.dispose().await;
        terminal.dispose().await;
        assert!(terminal.is_closed());

        let exit = terminal.wait().await;
        assert!(matches!(exit, TerminalExit::Exited { signal: Some(_), .. }));
        terminal.write(b"ignored").await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_without_support_is_ignored() {
        let (_adapter, terminal) = terminal().await;
        terminal
            .resize(TerminalSize { cols: 120, rows: 40 })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_terminal_ids_are_unique() {
        let (_a, first) = terminal().await;
        let (_b, second) = terminal().await;
        assert_ne!(first.id(), second.id());
    }
}
