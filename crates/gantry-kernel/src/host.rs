//! Kernel host: owns the component registry, the mesh router, the state
//! store, and the session manager, and wires them into one surface the
//! supervisor (and embedding code) drives.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{Notify, broadcast};

use gantry_mesh::{
    ComponentKind, ComponentRegistry, ComponentState, DynComponent, MeshRouter, Payload,
    RouterConfig,
};
use gantry_state::{SqliteStore, TaskSpec, TaskStatus};
use gantry_workspace::{SessionManager, SessionState, WorkspaceConfig};

use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::events::{EventSink, KernelEvent};
use crate::KernelResult;

pub struct KernelHost {
    config: KernelConfig,
    router: MeshRouter,
    store: Arc<SqliteStore>,
    sessions: SessionManager,
    events: EventSink,
    wake: Notify,
    /// Begin instants for sessions the host opened, for the idle sweep.
    session_ages: Mutex<HashMap<String, Instant>>,
}

impl KernelHost {
    /// Wire the kernel around an opened store. Runs workspace crash recovery
    /// before anything else can open a session.
    pub fn new(config: KernelConfig, store: SqliteStore) -> KernelResult<Self> {
        let sessions = SessionManager::new(WorkspaceConfig {
            scratch_root: config.scratch_root.clone(),
            commit_deadline: config.commit_deadline,
        })?;
        let report = sessions.recover()?;
        if report != Default::default() {
            tracing::info!(
                rolled_back = report.rolled_back,
                completed = report.completed,
                orphans_removed = report.orphans_removed,
                "workspace recovery"
            );
        }

        let router = MeshRouter::new(
            Arc::new(ComponentRegistry::new()),
            RouterConfig {
                mailbox_depth: config.mailbox_depth,
                default_deadline: config.mesh_timeout,
            },
        );

        Ok(Self {
            config,
            router,
            store: Arc::new(store),
            sessions,
            events: EventSink::default(),
            wake: Notify::new(),
            session_ages: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn router(&self) -> &MeshRouter {
        &self.router
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn events(&self) -> broadcast::Receiver<KernelEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: KernelEvent) {
        self.events.emit(event);
    }

    /// Register a component for routing and mirror it into the store.
    pub fn register_component(
        &self,
        name: &str,
        kind: ComponentKind,
        handler: DynComponent,
    ) -> KernelResult<()> {
        self.router.register(name, kind, handler);
        self.store
            .upsert_component(name, kind.as_str(), ComponentState::Registered.as_str())?;
        tracing::info!(component = name, kind = kind.as_str(), "component registered");
        Ok(())
    }

    pub fn unregister_component(&self, name: &str) -> KernelResult<bool> {
        let removed = self.router.unregister(name);
        self.store.remove_component(name)?;
        Ok(removed)
    }

    /// Persist a task and wake the supervisor.
    pub fn submit_task(&self, spec: TaskSpec) -> KernelResult<i64> {
        let id = self.store.insert_task(&spec)?;
        tracing::info!(task_id = id, priority = spec.priority, "task submitted");
        self.events.emit(KernelEvent::TaskTransition {
            task_id: id,
            status: TaskStatus::Pending,
            reason: None,
        });
        self.wake.notify_one();
        Ok(id)
    }

    pub(crate) async fn awoken(&self) {
        self.wake.notified().await;
    }

    /// Route one mesh call under the configured deadline. A call that leaves
    /// the target evicted is also reported on the event sink.
    pub async fn mesh_call(
        &self,
        target: &str,
        method: &str,
        payload: Payload,
    ) -> KernelResult<Payload> {
        let result = self
            .router
            .call(target, method, payload, self.config.mesh_timeout)
            .await;
        if result.is_err() && self.router.component_state(target) == Some(ComponentState::Failed) {
            self.events.emit(KernelEvent::ComponentFailed {
                name: target.to_string(),
            });
        }
        Ok(result?)
    }

    pub fn begin_session(&self, base_path: &Path, owner: Option<&str>) -> KernelResult<String> {
        let id = self.sessions.begin_session(base_path, owner)?;
        self.session_ages
            .lock()
            .expect("Mutex poisoned")
            .insert(id.clone(), Instant::now());
        Ok(id)
    }

    pub async fn commit_session(&self, id: &str) -> KernelResult<()> {
        let result = self.sessions.commit_session(id).await;
        self.session_settled(id);
        result.map_err(KernelError::from)
    }

    pub fn abort_session(&self, id: &str) -> KernelResult<()> {
        let result = self.sessions.abort_session(id);
        self.session_settled(id);
        result.map_err(KernelError::from)
    }

    /// Force-abort sessions idle past the configured deadline.
    pub(crate) fn expire_idle_sessions(&self) {
        let Some(deadline) = self.config.session_idle_deadline else {
            return;
        };
        let expired: Vec<String> = {
            let ages = self.session_ages.lock().expect("Mutex poisoned");
            ages.iter()
                .filter(|(_, begun)| begun.elapsed() > deadline)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in expired {
            tracing::warn!(session = %id, "session idle past deadline, aborting");
            if let Err(err) = self.abort_session(&id) {
                tracing::error!(session = %id, "idle abort failed: {err}");
            }
        }
    }

    /// Drop the age entry and emit the terminal state, once.
    fn session_settled(&self, id: &str) {
        let tracked = self
            .session_ages
            .lock()
            .expect("Mutex poisoned")
            .remove(id)
            .is_some();
        if !tracked {
            return;
        }
        let state = self
            .sessions
            .session_state(id)
            .unwrap_or(SessionState::Failed);
        self.events.emit(KernelEvent::SessionTerminal {
            session_id: id.to_string(),
            state,
        });
    }

    /// Record a forward task transition and emit it. Returns whether this
    /// call was the one that recorded it; a transition is never emitted
    /// twice.
    pub(crate) fn transition(
        &self,
        task_id: i64,
        status: TaskStatus,
        reason: Option<&str>,
    ) -> KernelResult<bool> {
        let recorded = self.store.update_task_status(task_id, status, reason)?;
        if recorded {
            self.events.emit(KernelEvent::TaskTransition {
                task_id,
                status,
                reason: reason.map(str::to_string),
            });
        }
        Ok(recorded)
    }
}
