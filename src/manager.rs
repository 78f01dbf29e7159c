//! Process-wide registry of project sessions.
//!
//! At most one [`Session`] exists per project id. Concurrent callers asking
//! for the same project share one in-flight creation, and a background sweep
//! reclaims sessions nobody has used for the idle timeout.

use anyhow::Result;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::ManagerSettings;
use crate::sandbox::{AdapterFactory, ProjectId, SandboxError};
use crate::session::{Session, SessionSnapshot};

/// Registry slot: empty while the session is being created.
type Slot = Arc<OnceCell<Arc<Session>>>;

/// Timing knobs for the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// How long a session may sit unused before the sweep reclaims it
    pub idle_timeout: Duration,
    /// Period of the background sweep
    pub sweep_interval: Duration,
    /// Port `preview` forwards when none is given
    pub default_preview_port: u16,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&ManagerSettings::default())
    }
}

impl From<&ManagerSettings> for ManagerConfig {
    fn from(settings: &ManagerSettings) -> Self {
        Self {
            idle_timeout: settings.idle_timeout(),
            sweep_interval: settings.sweep_interval(),
            default_preview_port: settings.default_preview_port,
        }
    }
}

/// Owns every live session. Must be created inside a tokio runtime.
pub struct SessionManager {
    inner: Arc<Registry>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

struct Registry {
    config: ManagerConfig,
    factory: Arc<dyn AdapterFactory>,
    slots: Mutex<HashMap<String, Slot>>,
    shut_down: AtomicBool,
}

impl SessionManager {
    /// Creates the manager and starts its idle sweep.
    pub fn new(config: ManagerConfig, factory: Arc<dyn AdapterFactory>) -> Self {
        let inner = Arc::new(Registry {
            config,
            factory,
            slots: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        });
        let sweeper = spawn_sweeper(Arc::downgrade(&inner), config.sweep_interval);

        Self {
            inner,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Timing knobs the manager was built with.
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Returns the project's session, creating it on first use.
    ///
    /// Concurrent calls for one project resolve to the same session. A failed
    /// creation leaves nothing registered, so the next call retries.
    pub async fn ensure_session(&self, project_id: &str) -> Result<Arc<Session>> {
        let project_id = ProjectId::parse(project_id)?;
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(SandboxError::session_closed(project_id.as_str()).into());
        }

        let slot = Arc::clone(
            self.inner
                .slots()
                .entry(project_id.as_str().to_string())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        );

        let created = slot
            .get_or_try_init(|| self.inner.create_session(&project_id))
            .await;

        match created {
            Ok(session) => {
                if self.inner.is_registered(&project_id, &slot) {
                    return Ok(Arc::clone(session));
                }
                // Released (or shut down) while it was being created
                debug!(project = %project_id, "Session orphaned during creation");
                session.dispose().await;
                Err(SandboxError::session_closed(project_id.as_str()).into())
            }
            Err(e) => {
                let mut slots = self.inner.slots();
                let is_empty_current = slots
                    .get(project_id.as_str())
                    .is_some_and(|current| Arc::ptr_eq(current, &slot) && current.get().is_none());
                if is_empty_current {
                    slots.remove(project_id.as_str());
                }
                Err(e)
            }
        }
    }

    /// The project's session, if one is live. Never creates.
    pub fn lookup(&self, project_id: &str) -> Option<Arc<Session>> {
        self.inner
            .slots()
            .get(project_id.trim())
            .and_then(|slot| slot.get().cloned())
    }

    /// Deregisters and disposes the project's session. Returns whether
    /// anything was registered.
    pub async fn release(&self, project_id: &str) -> bool {
        let project_id = project_id.trim();
        let Some(slot) = self.inner.slots().remove(project_id) else {
            return false;
        };
        if let Some(session) = slot.get() {
            session.dispose().await;
            info!(project = project_id, "Session released");
        }
        true
    }

    /// Disposes every idle session. Returns how many were reclaimed.
    pub async fn sweep(&self) -> usize {
        self.inner.sweep().await
    }

    /// Sessions that finished creating and are still registered.
    pub fn session_count(&self) -> usize {
        self.inner
            .slots()
            .values()
            .filter(|slot| slot.get().is_some())
            .count()
    }

    /// Snapshots of every live session.
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<Session>> = self
            .inner
            .slots()
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect();
        sessions.iter().map(|session| session.snapshot()).collect()
    }

    /// Whether the background idle sweep is still scheduled.
    pub fn is_sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the sweep and disposes every session. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        self.stop_sweeper();

        let slots: Vec<Slot> = self
            .inner
            .slots()
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        let sessions: Vec<Arc<Session>> =
            slots.iter().filter_map(|slot| slot.get().cloned()).collect();

        join_all(sessions.iter().map(|session| session.dispose())).await;
        info!(sessions = sessions.len(), "Session manager shut down");
    }

    fn stop_sweeper(&self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

impl Registry {
    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_registered(&self, project_id: &ProjectId, slot: &Slot) -> bool {
        self.slots()
            .get(project_id.as_str())
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    async fn create_session(&self, project_id: &ProjectId) -> Result<Arc<Session>> {
        let adapter = self.factory.create(project_id).await?;
        info!(
            project = %project_id,
            backend = %adapter.kind(),
            root = %adapter.root(),
            "Session created"
        );
        Ok(Arc::new(Session::new(project_id.clone(), adapter)))
    }

    async fn sweep(&self) -> usize {
        let idle: Vec<(String, Arc<Session>)> = {
            let mut slots = self.slots();
            let expired: Vec<String> = slots
                .iter()
                .filter(|(_, slot)| {
                    slot.get()
                        .is_some_and(|session| session.is_idle(self.config.idle_timeout))
                })
                .map(|(id, _)| id.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|id| {
                    let session = slots.remove(&id)?.get().cloned()?;
                    Some((id, session))
                })
                .collect()
        };

        if idle.is_empty() {
            return 0;
        }

        join_all(idle.iter().map(|(_, session)| session.dispose())).await;
        for (id, _) in &idle {
            info!(project = %id, "Reclaimed idle session");
        }
        idle.len()
    }
}

fn spawn_sweeper(registry: Weak<Registry>, period: Duration) -> JoinHandle<()> {
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(registry) = registry.upgrade() else {
                break;
            };
            let reclaimed = registry.sweep().await;
            if reclaimed > 0 {
                debug!(reclaimed, "Idle sweep finished");
            }
        }
    })
}
