//! Supervisor scheduler: claims pending tasks exactly once and drives each
//! through accept, session, run, and commit against its agent component.

use std::cmp;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::time::sleep;

use gantry_mesh::Payload;
use gantry_state::{StateError, TaskRecord, TaskStatus};

use crate::error::KernelError;
use crate::events::KernelEvent;
use crate::host::KernelHost;

pub struct Supervisor {
    host: Arc<KernelHost>,
}

impl Supervisor {
    pub fn new(host: Arc<KernelHost>) -> Self {
        Self { host }
    }

    /// Run until `shutdown` fires (or its sender drops).
    ///
    /// Each iteration drains the pending queue, then sleeps until a
    /// submission wakes it or the poll interval elapses. A store outage is
    /// the only error that stalls the loop; it is retried under exponential
    /// backoff and never exits the process.
    pub async fn run(&self, mut shutdown: oneshot::Receiver<()>) {
        let initial = self.host.config().backoff_initial;
        let max = self.host.config().backoff_max;
        let poll = self.host.config().poll_interval;
        let mut backoff = initial;

        loop {
            match self.drain().await {
                Ok(()) => backoff = initial,
                Err(StateError::Unavailable(reason)) => {
                    tracing::warn!("state store unavailable, retrying in {backoff:?}: {reason}");
                    sleep(backoff).await;
                    backoff = cmp::min(backoff * 2, max);
                    continue;
                }
                Err(err) => {
                    tracing::error!("claim failed: {err}");
                }
            }
            self.host.expire_idle_sessions();

            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("supervisor shutting down");
                    return;
                }
                _ = self.host.awoken() => {}
                _ = sleep(poll) => {}
            }
        }
    }

    /// Claim and execute until the pending queue is empty. A lost claim race
    /// comes back as `None` and ends the pass the same way an empty queue
    /// does.
    async fn drain(&self) -> Result<(), StateError> {
        loop {
            let worker = self.host.config().worker_id.clone();
            let Some(task) = self.host.store().claim_next_task(&worker)? else {
                return Ok(());
            };
            tracing::info!(task_id = task.id, worker = %worker, "task claimed");
            self.execute(task).await;
        }
    }

    /// Drive one claimed task to a terminal status. Every failure path
    /// records a reason on the row; nothing is retried automatically.
    ///
    /// The failure record itself must land somewhere: a store outage while
    /// writing it is retried under the same backoff policy as the claim
    /// loop, and a write the store permanently refuses still goes out on
    /// the event sink.
    async fn execute(&self, task: TaskRecord) {
        let task_id = task.id;
        let Err(err) = self.dispatch(&task).await else {
            return;
        };
        tracing::warn!(task_id, "task failed: {err}");
        let reason = err.to_string();

        let max = self.host.config().backoff_max;
        let mut backoff = self.host.config().backoff_initial;
        loop {
            match self
                .host
                .transition(task_id, TaskStatus::Failed, Some(&reason))
            {
                Ok(_) => return,
                Err(err) if err.is_store_unavailable() => {
                    tracing::warn!(
                        task_id,
                        "state store unavailable, retrying failure record in {backoff:?}: {err}"
                    );
                    sleep(backoff).await;
                    backoff = cmp::min(backoff * 2, max);
                }
                Err(err) => {
                    tracing::error!(task_id, "failed to record task failure: {err}");
                    self.host.emit(KernelEvent::TaskTransition {
                        task_id,
                        status: TaskStatus::Failed,
                        reason: Some(reason),
                    });
                    return;
                }
            }
        }
    }

    async fn dispatch(&self, task: &TaskRecord) -> Result<(), KernelError> {
        let agent = payload_str(&task.payload, "agent")?.to_string();
        let base_path = payload_str(&task.payload, "base_path")?.to_string();

        // Suitability check before any state moves: a rejection here leaves
        // no session behind.
        self.host
            .mesh_call(
                &agent,
                "task.accept",
                Payload::Json(json!({ "task_id": task.id, "payload": task.payload })),
            )
            .await?;
        self.host.transition(task.id, TaskStatus::Running, None)?;

        let session = self
            .host
            .begin_session(Path::new(&base_path), Some(&agent))?;
        let workspace_root = match self.host.sessions().workspace_root(&session) {
            Ok(root) => root,
            Err(err) => {
                let _ = self.host.abort_session(&session);
                return Err(err.into());
            }
        };

        // The agent only ever sees the session's private copy.
        let outcome = self
            .host
            .mesh_call(
                &agent,
                "task.run",
                Payload::Json(json!({
                    "task_id": task.id,
                    "workspace_root": workspace_root,
                    "payload": task.payload,
                })),
            )
            .await;

        match outcome {
            Ok(_) => {
                self.host.commit_session(&session).await?;
                self.host.transition(task.id, TaskStatus::Committed, None)?;
                tracing::info!(task_id = task.id, session = %session, "task committed");
                Ok(())
            }
            Err(err) => {
                // Abort never touches the base path, so it is always safe
                // to attempt.
                if let Err(abort_err) = self.host.abort_session(&session) {
                    tracing::error!(session = %session, "abort failed: {abort_err}");
                }
                Err(err)
            }
        }
    }
}

fn payload_str<'a>(payload: &'a Value, key: &str) -> Result<&'a str, KernelError> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| KernelError::TaskPayload(format!("missing '{key}'")))
}

/// Spawn a supervisor onto the runtime; dropping the returned sender (or
/// sending on it) stops the loop.
pub fn spawn(host: Arc<KernelHost>) -> oneshot::Sender<()> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let supervisor = Supervisor::new(host);
    tokio::spawn(async move {
        supervisor.run(shutdown_rx).await;
    });
    shutdown_tx
}
