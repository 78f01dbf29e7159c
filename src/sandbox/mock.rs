//! In-memory sandbox backend for testing.
//!
//! Shells are echo loops over an in-memory pipe: whatever is written comes
//! back on stdout, and a line starting with `exit` ends the shell with code 0.

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;

use super::shell::{reader_stream, ShellRegistry};
use super::{
    AdapterFactory, BackendKind, PortForward, ProjectFile, ProjectId, SandboxAdapter,
    SandboxError, ShellControl, ShellExit, ShellHandle,
};

/// A mock adapter that records every call for test assertions.
#[derive(Default)]
pub(crate) struct MockAdapter {
    pub project_id: String,
    synced: Mutex<Vec<ProjectFile>>,
    sync_count: AtomicUsize,
    spawn_count: AtomicUsize,
    open_count: AtomicUsize,
    close_count: AtomicUsize,
    dispose_count: AtomicUsize,
    held_port: Mutex<Option<(u16, Arc<Semaphore>)>>,
    shells: ShellRegistry,
}

impl MockAdapter {
    pub fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            ..Self::default()
        }
    }

    pub fn synced_files(&self) -> Vec<ProjectFile> {
        self.synced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn sync_count(&self) -> usize {
        self.sync_count.load(Ordering::SeqCst)
    }

    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn dispose_count(&self) -> usize {
        self.dispose_count.load(Ordering::SeqCst)
    }

    /// Opening `port` blocks until [`MockAdapter::let_port_open`] is called.
    pub fn hold_port(&self, port: u16) {
        *self.held_port.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((port, Arc::new(Semaphore::new(0))));
    }

    /// Lets held opens finish.
    pub fn let_port_open(&self) {
        if let Some((_, gate)) = &*self.held_port.lock().unwrap_or_else(PoisonError::into_inner) {
            gate.close();
        }
    }
}

#[async_trait]
impl SandboxAdapter for MockAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn root(&self) -> String {
        format!("mock://{}", self.project_id)
    }

    fn default_preview_port(&self) -> u16 {
        4173
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn sync_project(&self, files: &[ProjectFile]) -> Result<()> {
        super::project::validate_files(files)?;
        self.sync_count.fetch_add(1, Ordering::SeqCst);
        *self.synced.lock().unwrap_or_else(PoisonError::into_inner) = files.to_vec();
        Ok(())
    }

    async fn spawn_shell(&self) -> Result<ShellHandle> {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);

        let (ours, mut theirs) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(ours);
        let (control, supervisor) = ShellControl::channel();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let exit = loop {
                tokio::select! {
                    read = theirs.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break ShellExit::Exited { code: Some(0), signal: None },
                        Ok(n) => {
                            let chunk = &buf[..n];
                            if chunk.starts_with(b"exit") {
                                break ShellExit::Exited { code: Some(0), signal: None };
                            }
                            if theirs.write_all(chunk).await.is_err() {
                                break ShellExit::Exited { code: Some(0), signal: None };
                            }
                        }
                    },
                    () = supervisor.stop_requested() => {
                        break ShellExit::Exited { code: None, signal: Some(1) };
                    }
                }
            };
            drop(theirs);
            supervisor.finish(exit);
        });

        self.shells.track(&control);
        Ok(ShellHandle {
            stdin: Box::new(writer),
            stdout: reader_stream(reader),
            stderr: None,
            resize: None,
            control,
        })
    }

    async fn spawn_command(&self, command: &str) -> Result<ShellHandle> {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);

        // Prints the command back and exits successfully
        let (control, supervisor) = ShellControl::channel();
        supervisor.finish(ShellExit::Exited {
            code: Some(0),
            signal: None,
        });
        let output = Bytes::from(format!("{command}\n"));
        Ok(ShellHandle {
            stdin: Box::new(tokio::io::sink()),
            stdout: futures_util::stream::iter([Ok(output)]).boxed(),
            stderr: None,
            resize: None,
            control,
        })
    }

    async fn open_port_forward(&self, port: u16) -> Result<PortForward> {
        if port == 0 {
            return Err(SandboxError::invalid_port(port).into());
        }
        self.open_count.fetch_add(1, Ordering::SeqCst);
        let gate = self
            .held_port
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|(held, _)| *held == port)
            .map(|(_, gate)| Arc::clone(gate));
        if let Some(gate) = gate {
            // Closing the semaphore is what releases waiters
            let _ = gate.acquire().await;
        }
        // Give concurrent acquirers a chance to race
        tokio::task::yield_now().await;
        let local_port = port.wrapping_add(10_000).max(1);
        Ok(PortForward {
            remote_port: port,
            local_port,
            url: format!("http://127.0.0.1:{local_port}"),
        })
    }

    async fn close_port_forward(&self, _forward: &PortForward) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn dispose(&self) {
        self.dispose_count.fetch_add(1, Ordering::SeqCst);
        self.shells.terminate_all(Duration::from_millis(100)).await;
    }
}

/// A mock factory that hands out [`MockAdapter`]s and keeps them for inspection.
#[derive(Default)]
pub(crate) struct MockFactory {
    adapters: Mutex<Vec<Arc<MockAdapter>>>,
    create_count: AtomicUsize,
    fail: AtomicBool,
    delay: Option<Duration>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each creation sleeps for `delay` first, widening race windows.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn create_count(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }

    pub fn adapters(&self) -> Vec<Arc<MockAdapter>> {
        self.adapters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AdapterFactory for MockFactory {
    async fn create(&self, project_id: &ProjectId) -> Result<Arc<dyn SandboxAdapter>> {
        self.create_count.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            bail!(SandboxError::provisioning("mock factory configured to fail"));
        }

        let adapter = Arc::new(MockAdapter::new(project_id.as_str()));
        self.adapters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&adapter));
        Ok(adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_shell_echoes_until_exit() {
        let adapter = MockAdapter::new("demo");
        let mut shell = adapter.spawn_shell().await.unwrap();

        shell.stdin.write_all(b"hello").await.unwrap();
        let chunk = shell.stdout.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello");

        shell.stdin.write_all(b"exit\n").await.unwrap();
        assert_eq!(shell.control.wait().await.code(), Some(0));
        assert!(shell.stdout.next().await.is_none());
    }

    #[tokio::test]
    async fn test_mock_factory_records_adapters() {
        let factory = MockFactory::new();
        let id = ProjectId::parse("demo").unwrap();
        factory.create(&id).await.unwrap();
        assert_eq!(factory.create_count(), 1);
        assert_eq!(factory.adapters().len(), 1);

        factory.set_failing(true);
        let err = factory.create(&id).await.err().unwrap();
        assert!(err.downcast_ref::<SandboxError>().unwrap().is_provisioning());
        assert_eq!(factory.adapters().len(), 1);
    }
}
