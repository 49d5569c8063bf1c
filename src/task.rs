//! Task data model: the unit of work routed through the coordinator.

use crate::error::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Scheduling priority. Ordering is `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Lifecycle state of a task.
///
/// `Completed`, `Failed`, and `Cancelled` are terminal; transitions are
/// validated by [`TaskState::may_become`] so the ledger rejects backward moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }

    /// Whether a task in `self` may transition to `next`.
    ///
    /// `Assigned -> Pending` is the one sanctioned backward edge: a worker
    /// going offline returns its in-flight task to the queue.
    pub fn may_become(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (s, n) if s == n => true,
            (Pending, Assigned) | (Pending, Cancelled) | (Pending, Failed) => true,
            (Assigned, Running) | (Assigned, Pending) | (Assigned, Cancelled) => true,
            (Assigned, Failed) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            // Worker loss while running also re-queues.
            (Running, Pending) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Assigned => "assigned",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure info attached to a `Failed` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
    pub last_attempt_at: SystemTime,
    /// Root-cause description, when the failure wrapped another error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub underlying: Option<String>,
    /// Stack trace captured at the failure site; set for recovered panics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
}

impl TaskFailure {
    pub fn from_error(err: &Error, attempts: u32) -> Self {
        let underlying = err.cause().map(|c| c.root_cause().to_string());
        Self {
            kind: err.kind(),
            message: err.message().to_string(),
            attempts,
            last_attempt_at: SystemTime::now(),
            underlying,
            backtrace: err.backtrace().map(str::to_string),
        }
    }

    pub fn retryable(&self) -> bool {
        self.kind.default_retryable()
    }
}

/// The unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Type tag; workers resolve handlers by it.
    pub task_type: String,
    #[serde(default)]
    pub priority: Priority,
    /// Dynamic key/value input handed to the handler.
    #[serde(default)]
    pub input: serde_json::Map<String, serde_json::Value>,
    /// A worker is eligible only if its capability set is a superset.
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    /// Task ids that must complete before this task becomes eligible.
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub status: TaskState,
    pub created_at: SystemTime,
    #[serde(default)]
    pub started_at: Option<SystemTime>,
    #[serde(default)]
    pub completed_at: Option<SystemTime>,
    /// Per-task deadline; `None` means no deadline.
    #[serde(default)]
    pub deadline: Option<Duration>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<TaskFailure>,
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
}

impl Task {
    /// Validate the cross-field invariants a well-formed task upholds.
    pub fn validate(&self) -> Result<(), Error> {
        if self.id.is_empty() {
            return Err(Error::new(ErrorKind::MissingRequired, "task id is empty"));
        }
        if self.task_type.is_empty() {
            return Err(Error::new(ErrorKind::MissingRequired, "task type is empty"));
        }
        if self.max_attempts == 0 {
            return Err(Error::invalid_input("max_attempts must be > 0"));
        }
        if self.attempts > self.max_attempts {
            return Err(Error::invalid_input(format!(
                "attempts {} exceeds max_attempts {}",
                self.attempts, self.max_attempts
            )));
        }
        if let (Some(started), Some(completed)) = (self.started_at, self.completed_at) {
            if started > completed {
                return Err(Error::invalid_input("started_at is after completed_at"));
            }
        }
        if self.dependencies.iter().any(|d| d == &self.id) {
            return Err(Error::invalid_input("task depends on itself"));
        }
        Ok(())
    }
}

/// Client-facing submission request; the coordinator turns it into a [`Task`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Caller-supplied id enables idempotent resubmission; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub task_type: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub input: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub deadline: Option<Duration>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self { task_type: task_type.into(), ..Self::default() }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.input.insert(key.into(), value);
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.push(task_id.into());
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Materialize a `Pending` task, minting an id when the caller gave none.
    pub fn into_task(self, default_max_attempts: u32) -> Task {
        let id = self.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let name = if self.name.is_empty() { id.clone() } else { self.name };
        Task {
            id,
            name,
            description: self.description,
            task_type: self.task_type,
            priority: self.priority,
            input: self.input,
            required_capabilities: self.required_capabilities,
            dependencies: self.dependencies,
            status: TaskState::Pending,
            created_at: SystemTime::now(),
            started_at: None,
            completed_at: None,
            deadline: self.deadline,
            result: None,
            error: None,
            attempts: 0,
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts),
        }
    }
}

/// Append-only lifecycle event; together these form a task's audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub task_id: String,
    pub timestamp: SystemTime,
    pub state: TaskState,
    pub note: String,
    #[serde(default)]
    pub worker_id: Option<String>,
}

impl ProgressEntry {
    pub fn now(task_id: impl Into<String>, state: TaskState, note: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            timestamp: SystemTime::now(),
            state,
            note: note.into(),
            worker_id: None,
        }
    }

    pub fn by_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }
}

/// Predicate for paginated ledger queries and the autoscaler's backlog sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub status: Option<TaskState>,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub created_after: Option<SystemTime>,
    #[serde(default)]
    pub created_before: Option<SystemTime>,
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            capability: None,
            created_after: None,
            created_before: None,
            limit: 100,
            offset: 0,
        }
    }
}

impl TaskFilter {
    pub fn with_status(status: TaskState) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(capability) = &self.capability {
            if !task.required_capabilities.contains(capability) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if task.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if task.created_at >= before {
                return false;
            }
        }
        true
    }
}
