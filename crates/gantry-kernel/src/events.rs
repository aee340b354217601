//! Notification sink: a lossy broadcast of kernel lifecycle events.
//!
//! Emission is fire-and-forget. No subscribers is not an error, and a slow
//! subscriber lags and drops rather than backpressuring the kernel.

use tokio::sync::broadcast;

use gantry_state::TaskStatus;
use gantry_workspace::SessionState;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum KernelEvent {
    TaskTransition {
        task_id: i64,
        status: TaskStatus,
        reason: Option<String>,
    },
    SessionTerminal {
        session_id: String,
        state: SessionState,
    },
    ComponentFailed {
        name: String,
    },
}

pub struct EventSink {
    tx: broadcast::Sender<KernelEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl EventSink {
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: KernelEvent) {
        tracing::debug!(?event, "kernel event");
        let _ = self.tx.send(event);
    }
}
