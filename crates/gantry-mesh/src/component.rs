use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Payload;

/// The single capability every registered unit exposes: handle a mesh call.
///
/// Supervisors, agents, and tools all implement this one trait; their kind is
/// selection metadata, never a dispatch distinction. Handlers report rejection
/// through the `Err` string, which the router surfaces verbatim to the caller.
#[async_trait]
pub trait Component: Send + Sync {
    async fn handle(&self, method: &str, payload: Payload) -> Result<Payload, String>;
}

pub type DynComponent = Arc<dyn Component>;

/// Capability tag recorded at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentKind {
    Supervisor,
    Agent,
    Tool,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::Supervisor => "supervisor",
            ComponentKind::Agent => "agent",
            ComponentKind::Tool => "tool",
        }
    }
}

/// Lifecycle state of a registry entry.
///
/// `Failed` entries are evicted from routing until re-registered; every other
/// state is routable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Registered,
    Idle,
    Busy,
    Failed,
}

impl ComponentState {
    pub fn is_routable(self) -> bool {
        !matches!(self, ComponentState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ComponentState::Registered => "registered",
            ComponentState::Idle => "idle",
            ComponentState::Busy => "busy",
            ComponentState::Failed => "failed",
        }
    }
}
