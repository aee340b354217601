//! Task rows: the scheduler's unit of orchestrated work.

use serde_json::Value;

/// Task status, strictly forward:
/// `pending -> claimed -> running -> {committed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Claimed,
    Running,
    Committed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Committed => "committed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "claimed" => Some(TaskStatus::Claimed),
            "running" => Some(TaskStatus::Running),
            "committed" => Some(TaskStatus::Committed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Committed | TaskStatus::Failed)
    }

    /// Statuses a row may hold immediately before moving to `self`.
    pub(crate) fn allowed_prior(self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[],
            TaskStatus::Claimed => &[TaskStatus::Pending],
            TaskStatus::Running => &[TaskStatus::Claimed],
            TaskStatus::Committed => &[TaskStatus::Running],
            TaskStatus::Failed => &[TaskStatus::Claimed, TaskStatus::Running],
        }
    }
}

/// What an external trigger submits.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Higher claims first.
    pub priority: i64,
    /// Opaque to the store; the scheduler reads `agent` and `base_path` out
    /// of it at dispatch time.
    pub payload: Value,
}

impl TaskSpec {
    pub fn new(priority: i64, payload: Value) -> Self {
        Self { priority, payload }
    }
}

/// A task row as persisted. Never deleted by the kernel; terminal rows stay
/// for audit.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: i64,
    pub status: TaskStatus,
    pub priority: i64,
    pub payload: Value,
    pub agent: Option<String>,
    pub reason: Option<String>,
    pub created_at: i64,
}
