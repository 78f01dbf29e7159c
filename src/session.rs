//! One project's live sandbox and everything multiplexed over it.
//!
//! A [`Session`] exclusively owns its adapter and shares it between viewers:
//! - connections are counted so idle sessions can be reclaimed
//! - terminals are tracked until their shell exits
//! - port forwards are reference counted per remote port, so every viewer of
//!   the same port shares one underlying forward
//!
//! Bookkeeping lives under short synchronous locks that are never held across
//! an adapter call. A slow or stuck open only delays callers of that port.

use anyhow::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::sandbox::{
    best_effort, BackendKind, PortForward, ProjectFile, ProjectId, SandboxAdapter, SandboxError,
};
use crate::terminal::Terminal;

struct Activity {
    connections: usize,
    last_used: Instant,
}

/// One remote port's forward. Empty while the first acquirer opens it.
#[derive(Default)]
struct PortSlot {
    forward: OnceCell<PortForward>,
    closed: AtomicBool,
}

impl PortSlot {
    /// Closes the forward if it was opened and nobody closed it yet.
    async fn close(&self, adapter: &dyn SandboxAdapter) -> Result<bool> {
        let Some(forward) = self.forward.get() else {
            return Ok(false);
        };
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        adapter.close_port_forward(forward).await?;
        Ok(true)
    }
}

struct PortEntry {
    slot: Arc<PortSlot>,
    ref_count: usize,
}

/// A project's sandbox plus its shared terminals and port forwards.
pub struct Session {
    project_id: ProjectId,
    adapter: Arc<dyn SandboxAdapter>,
    created_at: DateTime<Utc>,
    activity: Mutex<Activity>,
    terminals: Mutex<HashMap<u64, Terminal>>,
    ports: Mutex<HashMap<u16, PortEntry>>,
    disposed: AtomicBool,
}

impl Session {
    /// Wraps a ready adapter. The session owns it from here on.
    pub fn new(project_id: ProjectId, adapter: Arc<dyn SandboxAdapter>) -> Self {
        Self {
            project_id,
            adapter,
            created_at: Utc::now(),
            activity: Mutex::new(Activity {
                connections: 0,
                last_used: Instant::now(),
            }),
            terminals: Mutex::new(HashMap::new()),
            ports: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// The id this session was registered under.
    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    /// The backend serving this session.
    pub fn adapter(&self) -> &Arc<dyn SandboxAdapter> {
        &self.adapter
    }

    /// Whether [`Session::dispose`] has started.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Viewers currently connected.
    pub fn connection_count(&self) -> usize {
        self.activity().connections
    }

    /// Terminals whose shell is still running.
    pub fn terminal_count(&self) -> usize {
        self.terminals().len()
    }

    /// References held on the forward for `port`, if one is open or opening.
    pub fn port_ref_count(&self, port: u16) -> Option<usize> {
        self.ports().get(&port).map(|entry| entry.ref_count)
    }

    /// Time since the session was last used.
    pub fn idle_for(&self) -> Duration {
        self.activity().last_used.elapsed()
    }

    /// Idle means nobody is connected and nothing happened for longer than `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        let activity = self.activity();
        activity.connections == 0 && activity.last_used.elapsed() > timeout
    }

    /// Registers a viewer. The connection is released when the guard is.
    pub fn acquire_connection(self: &Arc<Self>) -> Result<ConnectionGuard> {
        self.ensure_open()?;
        {
            let mut activity = self.activity();
            activity.connections += 1;
            activity.last_used = Instant::now();
        }
        debug!(project = %self.project_id, connections = self.connection_count(), "Connection acquired");
        Ok(ConnectionGuard {
            session: Arc::clone(self),
            released: false,
        })
    }

    fn release_connection(&self) {
        let mut activity = self.activity();
        activity.connections = activity.connections.saturating_sub(1);
        activity.last_used = Instant::now();
    }

    /// Replaces the workspace content with `files`.
    pub async fn sync_project(&self, files: &[ProjectFile]) -> Result<()> {
        self.ensure_open()?;
        self.adapter.sync_project(files).await?;
        self.touch();
        Ok(())
    }

    /// Opens a terminal on a fresh shell. The terminal is forgotten as soon
    /// as its shell exits.
    pub async fn create_terminal(self: &Arc<Self>) -> Result<Terminal> {
        self.ensure_open()?;
        let shell = self.adapter.spawn_shell().await?;
        self.register_terminal(Terminal::new(shell)).await
    }

    /// Runs one command without an interactive shell and tracks it as a
    /// terminal until the command exits. The receiver sees all its output.
    pub async fn run_command(
        self: &Arc<Self>,
        command: &str,
    ) -> Result<(Terminal, broadcast::Receiver<Bytes>)> {
        self.ensure_open()?;
        let (terminal, output) = Terminal::with_output(self.adapter.spawn_command(command).await?);
        Ok((self.register_terminal(terminal).await?, output))
    }

    async fn register_terminal(self: &Arc<Self>, terminal: Terminal) -> Result<Terminal> {
        // Checked under the lock dispose drains with
        let registered = {
            let mut terminals = self.terminals();
            if self.is_disposed() {
                false
            } else {
                terminals.insert(terminal.id(), terminal.clone());
                true
            }
        };
        if !registered {
            terminal.dispose().await;
            return Err(SandboxError::session_closed(self.project_id.as_str()).into());
        }

        let session = Arc::downgrade(self);
        let watched = terminal.clone();
        tokio::spawn(async move {
            watched.wait().await;
            if let Some(session) = session.upgrade() {
                session.terminals().remove(&watched.id());
            }
        });

        self.touch();
        debug!(project = %self.project_id, terminal = terminal.id(), "Terminal created");
        Ok(terminal)
    }

    /// Shares (or opens) the forward for `port` and takes a reference on it.
    ///
    /// Callers for the same port wait on a single open. Callers for other
    /// ports never wait on it.
    pub async fn acquire_port(self: &Arc<Self>, port: u16) -> Result<PortLease> {
        if port == 0 {
            return Err(SandboxError::invalid_port(port).into());
        }

        let slot = {
            let mut ports = self.ports();
            self.ensure_open()?;
            let entry = ports.entry(port).or_insert_with(|| PortEntry {
                slot: Arc::new(PortSlot::default()),
                ref_count: 0,
            });
            entry.ref_count += 1;
            Arc::clone(&entry.slot)
        };

        let opened = slot
            .forward
            .get_or_try_init(|| async {
                let forward = self.adapter.open_port_forward(port).await?;
                info!(project = %self.project_id, port, url = %forward.url, "Opened port forward");
                anyhow::Ok(forward)
            })
            .await
            .cloned();

        let forward = match opened {
            Ok(forward) => forward,
            Err(e) => {
                self.drop_port_ref(port, &slot);
                return Err(e);
            }
        };

        if !self.is_port_slot_live(port, &slot) {
            // Disposal drained the table while the forward was opening
            best_effort("close late port forward", slot.close(self.adapter.as_ref())).await;
            return Err(SandboxError::session_closed(self.project_id.as_str()).into());
        }

        self.touch();
        Ok(PortLease {
            session: Arc::clone(self),
            slot,
            forward,
            released: false,
        })
    }

    fn is_port_slot_live(&self, port: u16, slot: &Arc<PortSlot>) -> bool {
        let ports = self.ports();
        !self.is_disposed()
            && ports
                .get(&port)
                .is_some_and(|entry| Arc::ptr_eq(&entry.slot, slot))
    }

    /// Gives back one reference. Returns the slot when it was the last one.
    fn drop_port_ref(&self, port: u16, slot: &Arc<PortSlot>) -> Option<Arc<PortSlot>> {
        let mut ports = self.ports();
        let entry = ports
            .get_mut(&port)
            .filter(|entry| Arc::ptr_eq(&entry.slot, slot))?;
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return None;
        }
        ports.remove(&port).map(|entry| entry.slot)
    }

    async fn release_port(&self, port: u16, slot: &Arc<PortSlot>) -> Result<()> {
        let Some(slot) = self.drop_port_ref(port, slot) else {
            return Ok(());
        };
        if slot.close(self.adapter.as_ref()).await? {
            info!(project = %self.project_id, port, "Closed port forward");
        }
        Ok(())
    }

    /// Tears everything down: terminals, forwards (whatever their ref
    /// counts), then the adapter. Runs once; later calls return immediately.
    ///
    /// Forwards still opening are closed by their opener once it finishes.
    pub async fn dispose(&self) {
        let terminals: Vec<Terminal> = {
            let mut terminals = self.terminals();
            if self.disposed.swap(true, Ordering::SeqCst) {
                return;
            }
            terminals.drain().map(|(_, terminal)| terminal).collect()
        };
        join_all(terminals.iter().map(Terminal::dispose)).await;

        let slots: Vec<Arc<PortSlot>> = self
            .ports()
            .drain()
            .map(|(_, entry)| entry.slot)
            .collect();
        for slot in &slots {
            best_effort("close port forward", slot.close(self.adapter.as_ref())).await;
        }

        self.adapter.dispose().await;
        info!(
            project = %self.project_id,
            terminals = terminals.len(),
            forwards = slots.len(),
            "Session disposed"
        );
    }

    /// Point-in-time view of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        let mut ports: Vec<PortSnapshot> = self
            .ports()
            .values()
            .filter_map(|entry| {
                entry.slot.forward.get().map(|forward| PortSnapshot {
                    remote_port: forward.remote_port,
                    local_port: forward.local_port,
                    url: forward.url.clone(),
                    ref_count: entry.ref_count,
                })
            })
            .collect();
        ports.sort_by_key(|port| port.remote_port);

        SessionSnapshot {
            project_id: self.project_id.as_str().to_string(),
            backend: self.adapter.kind(),
            root: self.adapter.root(),
            created_at: self.created_at,
            idle_ms: u64::try_from(self.idle_for().as_millis()).unwrap_or(u64::MAX),
            connections: self.connection_count(),
            terminals: self.terminal_count(),
            ports,
        }
    }

    fn ensure_open(&self) -> Result<(), SandboxError> {
        if self.is_disposed() {
            return Err(SandboxError::session_closed(self.project_id.as_str()));
        }
        Ok(())
    }

    fn touch(&self) {
        self.activity().last_used = Instant::now();
    }

    fn activity(&self) -> MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn terminals(&self) -> MutexGuard<'_, HashMap<u64, Terminal>> {
        self.terminals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ports(&self) -> MutexGuard<'_, HashMap<u16, PortEntry>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A counted viewer connection. Dropping it releases the connection.
pub struct ConnectionGuard {
    session: Arc<Session>,
    released: bool,
}

impl ConnectionGuard {
    /// Releases the connection now instead of on drop.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.session.release_connection();
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.release_once();
    }
}

/// A reference on a shared port forward.
///
/// Call [`PortLease::release`] to give it back; a lease dropped without
/// release is given back on a background task.
pub struct PortLease {
    session: Arc<Session>,
    slot: Arc<PortSlot>,
    forward: PortForward,
    released: bool,
}

impl PortLease {
    /// Port inside the sandbox.
    pub fn remote_port(&self) -> u16 {
        self.forward.remote_port
    }

    /// Port on this machine.
    pub fn local_port(&self) -> u16 {
        self.forward.local_port
    }

    /// URL viewers open.
    pub fn url(&self) -> &str {
        &self.forward.url
    }

    /// Drops this reference; the last one closes the forward.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.session
            .release_port(self.forward.remote_port, &self.slot)
            .await
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let session = Arc::clone(&self.session);
        let slot = Arc::clone(&self.slot);
        let port = self.forward.remote_port;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                best_effort(
                    "release dropped port lease",
                    session.release_port(port, &slot),
                )
                .await;
            });
        }
    }
}

/// Serializable view of one shared port forward.
#[derive(Debug, Clone, Serialize)]
pub struct PortSnapshot {
    /// Port inside the sandbox
    pub remote_port: u16,
    /// Port on this machine
    pub local_port: u16,
    /// URL viewers open
    pub url: String,
    /// Leases sharing the forward
    pub ref_count: usize,
}

/// Serializable view of a session, for logs and CLI output.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Registry key
    pub project_id: String,
    /// Backend serving the session
    pub backend: BackendKind,
    /// Workspace location inside the backend
    pub root: String,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// Milliseconds since last use
    pub idle_ms: u64,
    /// Connected viewers
    pub connections: usize,
    /// Live terminals
    pub terminals: usize,
    /// Open forwards, by remote port
    pub ports: Vec<PortSnapshot>,
}
