//! In-memory ledger: a single lock over the task table plus an id slice kept
//! sorted on mutation so filtered scans page without re-sorting.

use super::{AgentStateRecord, Ledger, LedgerStats, TaskPatch};
use crate::error::{Error, Result};
use crate::task::{ProgressEntry, Task, TaskFilter};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    /// Task ids ordered by `(created_at desc, id asc)`.
    order: Vec<String>,
    progress: HashMap<String, Vec<ProgressEntry>>,
    agents: HashMap<String, AgentStateRecord>,
}

impl Inner {
    fn insert_ordered(&mut self, id: &str, created_at: SystemTime) {
        let position = self
            .order
            .partition_point(|existing| {
                let existing_task = &self.tasks[existing];
                // Descending by creation time; id ascending breaks ties so
                // pagination is stable.
                (existing_task.created_at, std::cmp::Reverse(existing_task.id.as_str()))
                    > (created_at, std::cmp::Reverse(id))
            });
        self.order.insert(position, id.to_string());
    }
}

#[derive(Default)]
pub struct InMemoryLedger {
    inner: Mutex<Inner>,
    closed: AtomicBool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed("ledger is closed"));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Drop a task row (cache-eviction hook for the hybrid ledger).
    pub(crate) fn remove_task(&self, id: &str) -> Option<Task> {
        let mut inner = self.lock();
        let removed = inner.tasks.remove(id);
        if removed.is_some() {
            inner.order.retain(|existing| existing != id);
        }
        removed
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn create_task(&self, task: Task) -> Result<()> {
        self.ensure_open()?;
        task.validate()?;
        let mut inner = self.lock();
        if inner.tasks.contains_key(&task.id) {
            return Err(Error::already_exists(format!("task '{}' already exists", task.id)));
        }
        let id = task.id.clone();
        let created_at = task.created_at;
        inner.tasks.insert(id.clone(), task);
        inner.insert_ordered(&id, created_at);
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.ensure_open()?;
        Ok(self.lock().tasks.get(id).cloned())
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        self.ensure_open()?;
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("task '{id}' not found")))?;

        if let Some(next) = patch.status {
            if !task.status.may_become(next) {
                return Err(Error::invalid_input(format!(
                    "task '{id}' cannot transition {} -> {next}",
                    task.status
                )));
            }
            task.status = next;
        }
        if let Some(started_at) = patch.started_at {
            task.started_at = Some(started_at);
        }
        if let Some(completed_at) = patch.completed_at {
            task.completed_at = Some(completed_at);
        }
        if let Some(result) = patch.result {
            task.result = Some(result);
        }
        if let Some(error) = patch.error {
            task.error = Some(error);
        }
        if let Some(attempts) = patch.attempts {
            task.attempts = attempts;
        }
        Ok(task.clone())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.ensure_open()?;
        let inner = self.lock();
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .filter(|task| filter.matches(task))
            .skip(filter.offset)
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn append_progress(&self, entry: ProgressEntry) -> Result<()> {
        self.ensure_open()?;
        self.lock().progress.entry(entry.task_id.clone()).or_default().push(entry);
        Ok(())
    }

    async fn progress(&self, task_id: &str) -> Result<Vec<ProgressEntry>> {
        self.ensure_open()?;
        Ok(self.lock().progress.get(task_id).cloned().unwrap_or_default())
    }

    async fn upsert_agent_state(&self, state: AgentStateRecord) -> Result<()> {
        self.ensure_open()?;
        self.lock().agents.insert(state.agent_id.clone(), state);
        Ok(())
    }

    async fn agent_states(&self) -> Result<Vec<AgentStateRecord>> {
        self.ensure_open()?;
        let mut states: Vec<AgentStateRecord> = self.lock().agents.values().cloned().collect();
        states.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(states)
    }

    async fn stats(&self) -> Result<LedgerStats> {
        self.ensure_open()?;
        let inner = self.lock();
        let mut stats = LedgerStats::default();
        for task in inner.tasks.values() {
            stats.count(task.status);
        }
        Ok(stats)
    }

    async fn health(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::task::{TaskRequest, TaskState};
    use serde_json::json;
    use std::time::Duration;

    fn task(id: &str) -> Task {
        TaskRequest::new("echo").id(id).capability("echo").into_task(3)
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let ledger = InMemoryLedger::new();
        let t = task("t1");
        ledger.create_task(t.clone()).await.unwrap();
        let fetched = ledger.get_task("t1").await.unwrap().unwrap();
        assert_eq!(fetched.id, t.id);
        assert_eq!(fetched.status, TaskState::Pending);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let ledger = InMemoryLedger::new();
        ledger.create_task(task("t1")).await.unwrap();
        let err = ledger.create_task(task("t1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn update_walks_the_lifecycle() {
        let ledger = InMemoryLedger::new();
        ledger.create_task(task("t1")).await.unwrap();

        ledger.update_task("t1", TaskPatch::status(TaskState::Assigned)).await.unwrap();
        ledger
            .update_task("t1", TaskPatch::status(TaskState::Running).with_started_now())
            .await
            .unwrap();
        let done = ledger.update_task("t1", TaskPatch::completed(json!({"out": "hi"}))).await.unwrap();
        assert_eq!(done.status, TaskState::Completed);
        assert_eq!(done.result, Some(json!({"out": "hi"})));
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn backward_transitions_are_rejected() {
        let ledger = InMemoryLedger::new();
        ledger.create_task(task("t1")).await.unwrap();
        ledger.update_task("t1", TaskPatch::status(TaskState::Assigned)).await.unwrap();
        ledger.update_task("t1", TaskPatch::status(TaskState::Running)).await.unwrap();
        ledger.update_task("t1", TaskPatch::completed(json!(null))).await.unwrap();

        let err = ledger
            .update_task("t1", TaskPatch::status(TaskState::Running))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        // Row untouched.
        let t = ledger.get_task("t1").await.unwrap().unwrap();
        assert_eq!(t.status, TaskState::Completed);
    }

    #[tokio::test]
    async fn update_missing_task_is_not_found() {
        let ledger = InMemoryLedger::new();
        let err = ledger
            .update_task("ghost", TaskPatch::status(TaskState::Assigned))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn list_orders_newest_first() {
        let ledger = InMemoryLedger::new();
        for id in ["a", "b", "c"] {
            let mut t = task(id);
            // Force strictly increasing timestamps.
            t.created_at = SystemTime::UNIX_EPOCH
                + Duration::from_secs(match id {
                    "a" => 1,
                    "b" => 2,
                    _ => 3,
                });
            ledger.create_task(t).await.unwrap();
        }
        let page = ledger.list_tasks(&TaskFilter::default()).await.unwrap();
        let ids: Vec<&str> = page.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn list_applies_filter_and_pagination() {
        let ledger = InMemoryLedger::new();
        for n in 0..10 {
            let mut t = task(&format!("t{n}"));
            t.created_at = SystemTime::UNIX_EPOCH + Duration::from_secs(n);
            ledger.create_task(t).await.unwrap();
        }
        ledger.update_task("t0", TaskPatch::status(TaskState::Cancelled)).await.unwrap();

        let filter = TaskFilter {
            status: Some(TaskState::Pending),
            limit: 4,
            offset: 2,
            ..TaskFilter::default()
        };
        let page = ledger.list_tasks(&filter).await.unwrap();
        let ids: Vec<&str> = page.iter().map(|t| t.id.as_str()).collect();
        // 9 pending tasks newest-first (t9..t1); skip 2, take 4.
        assert_eq!(ids, vec!["t7", "t6", "t5", "t4"]);
    }

    #[tokio::test]
    async fn progress_is_append_only_and_ordered() {
        let ledger = InMemoryLedger::new();
        ledger.create_task(task("t1")).await.unwrap();
        for (state, note) in [
            (TaskState::Pending, "submitted"),
            (TaskState::Assigned, "worker-1"),
            (TaskState::Running, "started"),
        ] {
            ledger.append_progress(ProgressEntry::now("t1", state, note)).await.unwrap();
        }
        let entries = ledger.progress("t1").await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].note, "submitted");
        assert_eq!(entries[2].state, TaskState::Running);
    }

    #[tokio::test]
    async fn agent_state_is_last_write_wins() {
        let ledger = InMemoryLedger::new();
        let mut record = AgentStateRecord {
            agent_id: "w1".to_string(),
            capabilities: ["echo".to_string()].into(),
            status: "idle".to_string(),
            last_heartbeat: SystemTime::now(),
            stats: serde_json::Value::Null,
        };
        ledger.upsert_agent_state(record.clone()).await.unwrap();
        record.status = "busy".to_string();
        ledger.upsert_agent_state(record).await.unwrap();

        let states = ledger.agent_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].status, "busy");
    }

    #[tokio::test]
    async fn stats_counts_by_status() {
        let ledger = InMemoryLedger::new();
        for id in ["a", "b", "c"] {
            ledger.create_task(task(id)).await.unwrap();
        }
        ledger.update_task("a", TaskPatch::status(TaskState::Assigned)).await.unwrap();
        ledger.update_task("a", TaskPatch::status(TaskState::Running)).await.unwrap();

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.running, 1);
    }

    #[tokio::test]
    async fn closed_ledger_rejects_operations() {
        let ledger = InMemoryLedger::new();
        ledger.close().await.unwrap();
        assert_eq!(
            ledger.create_task(task("t1")).await.unwrap_err().kind(),
            ErrorKind::Closed
        );
        assert_eq!(ledger.health().await.unwrap_err().kind(), ErrorKind::Closed);
        // Close is idempotent.
        ledger.close().await.unwrap();
    }
}
