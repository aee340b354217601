//! In-process mesh: typed, correlated request/response routing between
//! isolated components over bounded mailboxes.

pub mod component;
pub mod registry;
pub mod router;

pub use component::{Component, ComponentKind, ComponentState, DynComponent};
pub use registry::ComponentRegistry;
pub use router::{MeshRouter, RouterConfig};

use serde_json::Value;

pub type MeshResult<T> = Result<T, MeshError>;

/// Payload carried by a mesh call: either structured JSON or an opaque blob.
/// The router never inspects it; only the callee assigns it meaning.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Json(_) => None,
            Payload::Bytes(bytes) => Some(bytes),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("component '{0}' not found")]
    ComponentNotFound(String),
    #[error("call to '{target}' timed out after {elapsed_ms}ms")]
    Timeout { target: String, elapsed_ms: u64 },
    #[error("component '{target}' rejected call: {reason}")]
    CallRejected { target: String, reason: String },
    #[error("mailbox for component '{0}' is full")]
    MailboxFull(String),
}
