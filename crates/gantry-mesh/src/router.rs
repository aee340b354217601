use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use uuid::Uuid;

use crate::component::{ComponentKind, ComponentState, DynComponent};
use crate::registry::{ComponentEntry, ComponentRegistry};
use crate::{MeshError, MeshResult, Payload};

/// A single routed request. Lives only in the target's mailbox; the reply
/// channel is the correlation point, the id exists for logs and tracing.
pub struct MeshCall {
    pub method: String,
    pub payload: Payload,
    pub correlation: Uuid,
    pub reply_tx: oneshot::Sender<Result<Payload, String>>,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Bounded depth of every component mailbox. A full mailbox surfaces
    /// `MailboxFull` to the caller synchronously.
    pub mailbox_depth: usize,
    /// Deadline applied when the caller does not supply one.
    pub default_deadline: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mailbox_depth: 64,
            default_deadline: Duration::from_secs(30),
        }
    }
}

/// Routes calls to registered components over per-component mailboxes.
///
/// Each component gets its own mailbox and worker task, so a slow or wedged
/// component delays only its own callers. Delivery is FIFO per mailbox; there
/// is no ordering guarantee across targets.
pub struct MeshRouter {
    registry: Arc<ComponentRegistry>,
    config: RouterConfig,
}

impl MeshRouter {
    pub fn new(registry: Arc<ComponentRegistry>, config: RouterConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// Register a component and spawn its mailbox worker. Re-registering a
    /// name replaces the previous entry; in-flight calls on the old mailbox
    /// drain on the old worker.
    pub fn register(&self, name: &str, kind: ComponentKind, handler: DynComponent) {
        let (tx, rx) = mpsc::channel(self.config.mailbox_depth);
        let entry = Arc::new(ComponentEntry::new(name.to_string(), kind, tx));
        self.registry.insert(Arc::clone(&entry));
        tokio::spawn(run_worker(entry, rx, handler));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.registry.remove(name)
    }

    pub fn component_state(&self, name: &str) -> Option<ComponentState> {
        self.registry.get(name).map(|entry| entry.state())
    }

    pub async fn call_default(&self, target: &str, method: &str, payload: Payload) -> MeshResult<Payload> {
        self.call(target, method, payload, self.config.default_deadline).await
    }

    /// Route one call and await its correlated reply.
    ///
    /// On deadline expiry the wait is abandoned locally: the target may still
    /// finish the call, but its reply lands on a dropped channel and is
    /// discarded. The consumed mailbox slot is not refunded.
    pub async fn call(
        &self,
        target: &str,
        method: &str,
        payload: Payload,
        deadline: Duration,
    ) -> MeshResult<Payload> {
        let entry = self
            .registry
            .get(target)
            .ok_or_else(|| MeshError::ComponentNotFound(target.to_string()))?;
        if !entry.state().is_routable() {
            return Err(MeshError::ComponentNotFound(target.to_string()));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let call = MeshCall {
            method: method.to_string(),
            payload,
            correlation: Uuid::new_v4(),
            reply_tx,
        };
        let correlation = call.correlation;

        match entry.mailbox().try_send(call) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                return Err(MeshError::MailboxFull(target.to_string()));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(MeshError::ComponentNotFound(target.to_string()));
            }
        }
        log::debug!("mesh call {correlation} -> {target}.{method}");

        match timeout(deadline, reply_rx).await {
            Err(_) => Err(MeshError::Timeout {
                target: target.to_string(),
                elapsed_ms: deadline.as_millis() as u64,
            }),
            // Worker gone without replying: the component trapped mid-call.
            Ok(Err(_)) => Err(MeshError::ComponentNotFound(target.to_string())),
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(reason))) => Err(MeshError::CallRejected {
                target: target.to_string(),
                reason,
            }),
        }
    }
}

/// Mailbox worker: drains calls in acceptance order and invokes the handler.
///
/// A handler panic is treated as a component trap: the entry flips to
/// `Failed` (evicted from routing until re-registered), the caller of record
/// gets an error, queued calls are dropped, and the worker exits.
async fn run_worker(
    entry: Arc<ComponentEntry>,
    mut rx: mpsc::Receiver<MeshCall>,
    handler: DynComponent,
) {
    while let Some(call) = rx.recv().await {
        let MeshCall {
            method,
            payload,
            correlation,
            reply_tx,
        } = call;

        entry.set_state(ComponentState::Busy);
        let outcome = AssertUnwindSafe(handler.handle(&method, payload))
            .catch_unwind()
            .await;
        match outcome {
            Ok(result) => {
                entry.set_state(ComponentState::Idle);
                // A dropped receiver means the caller stopped waiting.
                let _ = reply_tx.send(result);
            }
            Err(_) => {
                log::error!(
                    "component '{}' trapped handling call {correlation} ({method})",
                    entry.name()
                );
                entry.set_state(ComponentState::Failed);
                let _ = reply_tx.send(Err(format!(
                    "component '{}' trapped while handling '{method}'",
                    entry.name()
                )));
                rx.close();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Component;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct Echo;

    #[async_trait]
    impl Component for Echo {
        async fn handle(&self, method: &str, payload: Payload) -> Result<Payload, String> {
            match method {
                "echo" => Ok(payload),
                "reject" => Err("not my job".into()),
                other => Err(format!("unknown method '{other}'")),
            }
        }
    }

    struct Stall(Duration);

    #[async_trait]
    impl Component for Stall {
        async fn handle(&self, _method: &str, payload: Payload) -> Result<Payload, String> {
            tokio::time::sleep(self.0).await;
            Ok(payload)
        }
    }

    struct Panicker;

    #[async_trait]
    impl Component for Panicker {
        async fn handle(&self, _method: &str, _payload: Payload) -> Result<Payload, String> {
            panic!("boom");
        }
    }

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Component for Recorder {
        async fn handle(&self, method: &str, _payload: Payload) -> Result<Payload, String> {
            self.seen.lock().unwrap().push(method.to_string());
            Ok(Payload::Json(json!(null)))
        }
    }

    fn router() -> MeshRouter {
        MeshRouter::new(Arc::new(ComponentRegistry::new()), RouterConfig::default())
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let router = router();
        router.register("echo", ComponentKind::Tool, Arc::new(Echo));

        let reply = router
            .call("echo", "echo", Payload::Json(json!({"n": 1})), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, Payload::Json(json!({"n": 1})));

        let state = router.component_state("echo").unwrap();
        assert_eq!(state, ComponentState::Idle);
    }

    #[tokio::test]
    async fn rejection_surfaces_verbatim() {
        let router = router();
        router.register("echo", ComponentKind::Tool, Arc::new(Echo));

        let err = router
            .call("echo", "reject", Payload::Json(json!(null)), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            MeshError::CallRejected { reason, .. } => assert_eq!(reason, "not my job"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_target_is_not_found() {
        let router = router();
        let err = router
            .call("ghost", "echo", Payload::Json(json!(null)), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::ComponentNotFound(_)));
    }

    #[tokio::test]
    async fn deadline_expiry_does_not_block_other_targets() {
        let router = router();
        router.register("slow", ComponentKind::Agent, Arc::new(Stall(Duration::from_secs(30))));
        router.register("fast", ComponentKind::Tool, Arc::new(Echo));

        let slow = router.call("slow", "work", Payload::Json(json!(null)), Duration::from_millis(50));
        let fast = router.call("fast", "echo", Payload::Json(json!("hi")), Duration::from_secs(1));

        let (slow_result, fast_result) = tokio::join!(slow, fast);
        assert!(matches!(slow_result, Err(MeshError::Timeout { .. })));
        assert_eq!(fast_result.unwrap(), Payload::Json(json!("hi")));
    }

    #[tokio::test]
    async fn full_mailbox_is_backpressure() {
        let registry = Arc::new(ComponentRegistry::new());
        let config = RouterConfig {
            mailbox_depth: 1,
            ..RouterConfig::default()
        };
        let router = MeshRouter::new(registry, config);
        router.register("slow", ComponentKind::Agent, Arc::new(Stall(Duration::from_secs(30))));

        // The enqueue happens on the first poll; abandoning the wait leaves
        // the message in the mailbox (the slot is not refunded). First call
        // is picked up by the worker, second occupies the single slot, third
        // must bounce synchronously.
        let _ = router
            .call("slow", "work", Payload::Json(json!(1)), Duration::from_secs(1))
            .now_or_never();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = router
            .call("slow", "work", Payload::Json(json!(2)), Duration::from_secs(1))
            .now_or_never();

        let err = router
            .call("slow", "work", Payload::Json(json!(3)), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::MailboxFull(_)));
    }

    #[tokio::test]
    async fn panicking_component_is_evicted() {
        let router = router();
        router.register("bad", ComponentKind::Tool, Arc::new(Panicker));

        let err = router
            .call("bad", "work", Payload::Json(json!(null)), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            MeshError::CallRejected { reason, .. } => assert!(reason.contains("trapped")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(router.component_state("bad"), Some(ComponentState::Failed));

        let err = router
            .call("bad", "work", Payload::Json(json!(null)), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::ComponentNotFound(_)));

        // Re-registration brings the name back into routing.
        router.register("bad", ComponentKind::Tool, Arc::new(Echo));
        router
            .call("bad", "echo", Payload::Json(json!(null)), Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delivery_is_fifo_per_mailbox() {
        let router = router();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        router.register("rec", ComponentKind::Tool, recorder.clone());

        // join_all polls in order on the first pass, so the try_sends land in
        // the mailbox in vec order.
        let methods: Vec<String> = (0..8).map(|i| format!("m{i}")).collect();
        let calls: Vec<_> = methods
            .iter()
            .map(|m| router.call("rec", m, Payload::Json(json!(null)), Duration::from_secs(1)))
            .collect();
        for result in futures::future::join_all(calls).await {
            result.unwrap();
        }

        let seen = recorder.seen.lock().unwrap().clone();
        let expected: Vec<String> = (0..8).map(|i| format!("m{i}")).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn binary_payloads_pass_through_opaque() {
        let router = router();
        router.register("echo", ComponentKind::Tool, Arc::new(Echo));

        let reply = router
            .call("echo", "echo", Payload::Bytes(vec![0, 159, 146, 150]), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.as_bytes(), Some(&[0u8, 159, 146, 150][..]));
    }
}
