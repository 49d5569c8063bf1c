//! Durable task ledger: lifecycle state, progress audit log, agent state.
//!
//! The in-memory backend lives here; the relational backend is provided by
//! the `drover-postgres` companion crate behind the same trait.

mod hybrid;
mod memory;

pub use hybrid::HybridLedger;
pub use memory::InMemoryLedger;

use crate::error::Result;
use crate::task::{ProgressEntry, Task, TaskFailure, TaskFilter, TaskState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::SystemTime;

/// Partial update applied to a task row.
///
/// Status changes are validated against [`TaskState::may_become`]; a backward
/// transition is rejected without modifying the row.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskState>,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
    pub attempts: Option<u32>,
}

impl TaskPatch {
    pub fn status(status: TaskState) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            status: Some(TaskState::Completed),
            completed_at: Some(SystemTime::now()),
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn failed(failure: TaskFailure) -> Self {
        Self {
            status: Some(TaskState::Failed),
            completed_at: Some(SystemTime::now()),
            error: Some(failure),
            ..Self::default()
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_started_now(mut self) -> Self {
        self.started_at = Some(SystemTime::now());
        self
    }
}

/// Last-known state of an agent, mirrored into the ledger for operators and
/// the autoscaler. Status is kept as text so the ledger stays decoupled from
/// pool internals (and matches the relational schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateRecord {
    pub agent_id: String,
    pub capabilities: BTreeSet<String>,
    pub status: String,
    pub last_heartbeat: SystemTime,
    #[serde(default)]
    pub stats: serde_json::Value,
}

/// Cheap summary used by `/metrics` and the autoscaler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total: usize,
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl LedgerStats {
    pub fn count(&mut self, state: TaskState) {
        self.total += 1;
        match state {
            TaskState::Pending => self.pending += 1,
            TaskState::Assigned => self.assigned += 1,
            TaskState::Running => self.running += 1,
            TaskState::Completed => self.completed += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::Cancelled => self.cancelled += 1,
        }
    }
}

/// Durable store of task lifecycle state and progress events.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Persist a new task. Fails with `AlreadyExists` on a duplicate id.
    async fn create_task(&self, task: Task) -> Result<()>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Apply `patch` atomically, returning the updated row. Backward state
    /// transitions fail with `InvalidInput` and leave the row untouched.
    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task>;

    /// Filtered page ordered by `created_at` descending (stable).
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Append-only audit record.
    async fn append_progress(&self, entry: ProgressEntry) -> Result<()>;

    /// Progress entries for a task, oldest first.
    async fn progress(&self, task_id: &str) -> Result<Vec<ProgressEntry>>;

    /// Last-write-wins upsert of an agent's observed state.
    async fn upsert_agent_state(&self, state: AgentStateRecord) -> Result<()>;

    async fn agent_states(&self) -> Result<Vec<AgentStateRecord>>;

    async fn stats(&self) -> Result<LedgerStats>;

    async fn health(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Backend selector for [`crate::config::LedgerConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LedgerKind {
    #[default]
    InMemory,
    Relational,
    /// Relational backend fronted by the in-memory ledger as a read cache.
    Hybrid,
}

impl std::str::FromStr for LedgerKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in-memory" => Ok(LedgerKind::InMemory),
            "relational" => Ok(LedgerKind::Relational),
            "hybrid" => Ok(LedgerKind::Hybrid),
            other => {
                Err(crate::error::Error::invalid_config(format!("unknown ledger type '{other}'")))
            }
        }
    }
}
