//! Durable relational state for the kernel: the `tasks` and `components`
//! tables, reachable through a plain query/execute contract plus the
//! transactional claim helpers the scheduler depends on.

mod sqlite;
pub mod tasks;

pub use sqlite::SqliteStore;
pub use tasks::{TaskRecord, TaskSpec, TaskStatus};

pub type StateResult<T> = Result<T, StateError>;

/// One result row: ordered column names and their stringified values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub columns: Vec<String>,
    pub values: Vec<String>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| self.values[idx].as_str())
    }
}

/// The store contract the kernel consumes. Parameters bind positionally as
/// strings; results come back as string rows.
pub trait StateStore: Send + Sync {
    fn query(&self, sql: &str, params: &[&str]) -> StateResult<Vec<Row>>;
    fn execute(&self, sql: &str, params: &[&str]) -> StateResult<u64>;
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The store cannot be reached or cannot make progress. The only store
    /// error the scheduler treats as fatal to its loop.
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("query failed: {0}")]
    Query(String),
}

impl From<rusqlite::Error> for StateError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::ConstraintViolation => StateError::Constraint(err.to_string()),
                ErrorCode::CannotOpen
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::DiskFull => StateError::Unavailable(err.to_string()),
                _ => StateError::Query(err.to_string()),
            },
            _ => StateError::Query(err.to_string()),
        }
    }
}
