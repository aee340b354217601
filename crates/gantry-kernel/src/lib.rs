//! Orchestration kernel: the supervisor scheduler and the host wiring that
//! binds the mesh router, the state store, and the workspace session manager
//! into one headless surface.
//!
//! The kernel is a library; embedding code opens a store, builds a
//! [`KernelHost`], registers components, and runs a [`Supervisor`]. There is
//! no binary, no network surface, and no global state.

pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod scheduler;

pub use config::KernelConfig;
pub use error::KernelError;
pub use events::{EventSink, KernelEvent};
pub use host::KernelHost;
pub use scheduler::Supervisor;

pub type KernelResult<T> = Result<T, KernelError>;
