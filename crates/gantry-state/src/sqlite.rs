use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};

use crate::tasks::{TaskRecord, TaskSpec, TaskStatus};
use crate::{Row, StateError, StateResult, StateStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    status      TEXT    NOT NULL DEFAULT 'pending',
    priority    INTEGER NOT NULL DEFAULT 0,
    payload     TEXT    NOT NULL,
    agent       TEXT,
    reason      TEXT,
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_claim
    ON tasks(status, priority DESC, created_at ASC, id ASC);
CREATE TABLE IF NOT EXISTS components (
    name          TEXT PRIMARY KEY,
    kind          TEXT NOT NULL,
    state         TEXT NOT NULL,
    registered_at INTEGER NOT NULL
);
";

const TASK_COLUMNS: &str = "id, status, priority, payload, agent, reason, created_at";

/// SQLite-backed state store. One connection behind a mutex; the claim
/// transaction is the store-level mutual-exclusion point for task
/// assignment, so it stays correct with several claimants (or processes,
/// via SQLite's own locking) racing on one database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StateResult<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| StateError::Unavailable(e.to_string()))?;
        Self::bootstrap(conn)
    }

    pub fn open_in_memory() -> StateResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StateError::Unavailable(e.to_string()))?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> StateResult<Self> {
        conn.execute_batch(SCHEMA)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert_task(&self, spec: &TaskSpec) -> StateResult<i64> {
        let conn = self.conn.lock().expect("Mutex poisoned");
        conn.execute(
            "INSERT INTO tasks (status, priority, payload, created_at) VALUES ('pending', ?1, ?2, ?3)",
            params![spec.priority, spec.payload.to_string(), now_millis()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Atomically claim the next pending task for `worker`.
    ///
    /// Highest priority wins, ties broken by earliest creation, then lowest
    /// id, so claim order is total. Returns `Ok(None)` both when the queue is
    /// empty and when a concurrent claimant won the row first; the caller
    /// retries on its next iteration either way.
    pub fn claim_next_task(&self, worker: &str) -> StateResult<Option<TaskRecord>> {
        let mut conn = self.conn.lock().expect("Mutex poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate: Option<i64> = tx
            .query_row(
                "SELECT id FROM tasks WHERE status = 'pending'
                 ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        let updated = tx.execute(
            "UPDATE tasks SET status = 'claimed', agent = ?1 WHERE id = ?2 AND status = 'pending'",
            params![worker, id],
        )?;
        let record = if updated == 1 {
            let record = tx.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                read_task_row,
            )?;
            log::debug!("task {id} claimed by '{worker}'");
            Some(record)
        } else {
            // Lost the row to a concurrent claimant between select and
            // update: an expected race, silently retried by the caller.
            None
        };
        tx.commit()?;
        Ok(record)
    }

    /// Record a status transition. Only the forward edges of the task state
    /// machine apply; anything else leaves the row untouched and returns
    /// `false`, so a transition can never be recorded twice.
    pub fn update_task_status(
        &self,
        id: i64,
        status: TaskStatus,
        reason: Option<&str>,
    ) -> StateResult<bool> {
        let prior = status.allowed_prior();
        if prior.is_empty() {
            return Ok(false);
        }
        let prior_list = prior
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let conn = self.conn.lock().expect("Mutex poisoned");
        let updated = conn.execute(
            &format!(
                "UPDATE tasks SET status = ?1, reason = ?2 WHERE id = ?3 AND status IN ({prior_list})"
            ),
            params![status.as_str(), reason, id],
        )?;
        if updated == 1 {
            log::debug!("task {id} -> {}", status.as_str());
        }
        Ok(updated == 1)
    }

    pub fn get_task(&self, id: i64) -> StateResult<Option<TaskRecord>> {
        let conn = self.conn.lock().expect("Mutex poisoned");
        let record = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                read_task_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>) -> StateResult<Vec<TaskRecord>> {
        let conn = self.conn.lock().expect("Mutex poisoned");
        let mut records = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY id ASC"
                ))?;
                let rows = stmt.query_map(params![status.as_str()], read_task_row)?;
                for row in rows {
                    records.push(row?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id ASC"))?;
                let rows = stmt.query_map([], read_task_row)?;
                for row in rows {
                    records.push(row?);
                }
            }
        }
        Ok(records)
    }

    /// Mirror a registry entry into the `components` table.
    pub fn upsert_component(&self, name: &str, kind: &str, state: &str) -> StateResult<()> {
        let conn = self.conn.lock().expect("Mutex poisoned");
        conn.execute(
            "INSERT INTO components (name, kind, state, registered_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET kind = ?2, state = ?3",
            params![name, kind, state, now_millis()],
        )?;
        Ok(())
    }

    pub fn remove_component(&self, name: &str) -> StateResult<bool> {
        let conn = self.conn.lock().expect("Mutex poisoned");
        let removed = conn.execute("DELETE FROM components WHERE name = ?1", params![name])?;
        Ok(removed == 1)
    }
}

impl StateStore for SqliteStore {
    fn query(&self, sql: &str, params: &[&str]) -> StateResult<Vec<Row>> {
        let conn = self.conn.lock().expect("Mutex poisoned");
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                values.push(stringify(row.get_ref(idx)?));
            }
            out.push(Row {
                columns: columns.clone(),
                values,
            });
        }
        Ok(out)
    }

    fn execute(&self, sql: &str, params: &[&str]) -> StateResult<u64> {
        let conn = self.conn.lock().expect("Mutex poisoned");
        let affected = conn.execute(sql, params_from_iter(params.iter()))?;
        Ok(affected as u64)
    }
}

fn stringify(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => String::from_utf8_lossy(b).into_owned(),
    }
}

fn read_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let status: String = row.get(1)?;
    let payload: String = row.get(3)?;
    Ok(TaskRecord {
        id: row.get(0)?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
        priority: row.get(2)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        agent: row.get(4)?,
        reason: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
