use thiserror::Error;

use gantry_mesh::MeshError;
use gantry_state::StateError;
use gantry_workspace::SessionError;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("mesh error: {0}")]
    Mesh(#[from] MeshError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("invalid task payload: {0}")]
    TaskPayload(String),
}

impl KernelError {
    /// Whether this error means the state store cannot make progress. The
    /// supervisor backs off and retries on these instead of recording a task
    /// failure.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, KernelError::State(StateError::Unavailable(_)))
    }
}
