//! Isolated, disposable workspace sessions with atomic commit back to the
//! base directory.
//!
//! A session is a private recursive copy of a base path. Components work only
//! against the copy; `commit_session` computes the file-level change set,
//! serializes against other commits to the same base, revalidates begin-time
//! fingerprints, and applies the changes through an on-disk journal so that
//! an interruption can always be rolled back to a fully pre-commit base.

pub mod changeset;
pub mod fingerprint;
pub mod journal;
pub mod manager;

pub use changeset::{ChangeSet, FileChange};
pub use manager::{RecoveryReport, SessionManager, WorkspaceConfig};

use std::io;
use std::path::PathBuf;

pub type SessionId = String;
pub type SessionResult<T> = Result<T, SessionError>;

/// Session lifecycle. `Committed`, `Aborted`, and `Failed` are terminal; the
/// temporary copy is reclaimed on any terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    Diffing,
    Committing,
    Committed,
    Aborted,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Committed | SessionState::Aborted | SessionState::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Active => "active",
            SessionState::Diffing => "diffing",
            SessionState::Committing => "committing",
            SessionState::Committed => "committed",
            SessionState::Aborted => "aborted",
            SessionState::Failed => "failed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("base path not found: {0}")]
    BasePathNotFound(PathBuf),
    #[error("workspace copy failed: {0}")]
    CopyFailed(String),
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("session '{id}' is {state}, expected {expected}")]
    InvalidState {
        id: String,
        state: &'static str,
        expected: &'static str,
    },
    #[error("file '{0}' changed in the base path since the session began")]
    SessionConflict(String),
    #[error("failed to apply change set: {0}")]
    DiffApplyFailure(String),
    #[error("commit lock not acquired within {0:?}")]
    CommitTimeout(std::time::Duration),
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> SessionError {
    SessionError::Io {
        path: path.into(),
        source: err,
    }
}
