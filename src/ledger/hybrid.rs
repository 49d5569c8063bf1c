//! Hybrid ledger: a durable backend fronted by the in-memory ledger as a
//! read cache for hot task rows.
//!
//! Writes land on the durable store first (it stays authoritative), then the
//! cache. Reads try the cache and fall back to the store, seeding the cache
//! on a hit. Progress, agent state, listings, and stats go straight to the
//! durable store: those are audit/reporting paths, not the dispatch hot path.

use super::{AgentStateRecord, InMemoryLedger, Ledger, LedgerStats, TaskPatch};
use crate::error::{ErrorKind, Result};
use crate::task::{ProgressEntry, Task, TaskFilter};
use async_trait::async_trait;
use std::sync::Arc;

pub struct HybridLedger {
    cache: InMemoryLedger,
    durable: Arc<dyn Ledger>,
}

impl HybridLedger {
    pub fn new(durable: Arc<dyn Ledger>) -> Self {
        Self { cache: InMemoryLedger::new(), durable }
    }

    async fn seed_cache(&self, task: &Task) {
        match self.cache.create_task(task.clone()).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => tracing::debug!(task_id = %task.id, error = %err, "cache seed failed"),
        }
    }

    /// Apply an already-committed durable update to the cache, seeding the
    /// row when the cache never saw it.
    async fn refresh_cache(&self, updated: &Task) {
        let replace = match self.cache.get_task(&updated.id).await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(_) => return,
        };
        if replace {
            // The durable row is authoritative; rebuild the cached copy
            // rather than replaying the patch against possibly stale state.
            let _ = self.cache.remove_task(&updated.id);
        }
        self.seed_cache(updated).await;
    }
}

#[async_trait]
impl Ledger for HybridLedger {
    async fn create_task(&self, task: Task) -> Result<()> {
        self.durable.create_task(task.clone()).await?;
        self.seed_cache(&task).await;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        if let Some(cached) = self.cache.get_task(id).await? {
            return Ok(Some(cached));
        }
        let fetched = self.durable.get_task(id).await?;
        if let Some(task) = &fetched {
            self.seed_cache(task).await;
        }
        Ok(fetched)
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        let updated = self.durable.update_task(id, patch).await?;
        self.refresh_cache(&updated).await;
        Ok(updated)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.durable.list_tasks(filter).await
    }

    async fn append_progress(&self, entry: ProgressEntry) -> Result<()> {
        self.durable.append_progress(entry).await
    }

    async fn progress(&self, task_id: &str) -> Result<Vec<ProgressEntry>> {
        self.durable.progress(task_id).await
    }

    async fn upsert_agent_state(&self, state: AgentStateRecord) -> Result<()> {
        self.durable.upsert_agent_state(state).await
    }

    async fn agent_states(&self) -> Result<Vec<AgentStateRecord>> {
        self.durable.agent_states().await
    }

    async fn stats(&self) -> Result<LedgerStats> {
        self.durable.stats().await
    }

    async fn health(&self) -> Result<()> {
        self.cache.health().await?;
        self.durable.health().await
    }

    async fn close(&self) -> Result<()> {
        self.cache.close().await?;
        self.durable.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskRequest, TaskState};
    use serde_json::json;

    fn hybrid() -> (HybridLedger, Arc<InMemoryLedger>) {
        let durable = Arc::new(InMemoryLedger::new());
        (HybridLedger::new(durable.clone()), durable)
    }

    fn task(id: &str) -> Task {
        TaskRequest::new("echo").id(id).capability("echo").into_task(3)
    }

    #[tokio::test]
    async fn writes_reach_the_durable_store() {
        let (hybrid, durable) = hybrid();
        hybrid.create_task(task("t1")).await.unwrap();
        assert!(durable.get_task("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reads_fall_back_and_seed_the_cache() {
        let (hybrid, durable) = hybrid();
        // Row created behind the cache's back.
        durable.create_task(task("t1")).await.unwrap();

        let fetched = hybrid.get_task("t1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "t1");
        // Cached now: a durable-side delete no longer hides it.
        assert!(hybrid.cache.get_task("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn updates_keep_cache_and_store_aligned() {
        let (hybrid, durable) = hybrid();
        hybrid.create_task(task("t1")).await.unwrap();
        hybrid.update_task("t1", TaskPatch::status(TaskState::Assigned)).await.unwrap();
        hybrid.update_task("t1", TaskPatch::status(TaskState::Running)).await.unwrap();
        hybrid.update_task("t1", TaskPatch::completed(json!("done"))).await.unwrap();

        let cached = hybrid.get_task("t1").await.unwrap().unwrap();
        let stored = durable.get_task("t1").await.unwrap().unwrap();
        assert_eq!(cached.status, TaskState::Completed);
        assert_eq!(stored.status, TaskState::Completed);
        assert_eq!(cached.result, stored.result);
    }

    #[tokio::test]
    async fn invalid_transition_touches_neither_side() {
        let (hybrid, durable) = hybrid();
        hybrid.create_task(task("t1")).await.unwrap();
        hybrid.update_task("t1", TaskPatch::completed(json!(null))).await.unwrap_err();
        // Pending -> Completed is not a legal edge; both sides still Pending.
        assert_eq!(
            durable.get_task("t1").await.unwrap().unwrap().status,
            TaskState::Pending
        );
        assert_eq!(
            hybrid.get_task("t1").await.unwrap().unwrap().status,
            TaskState::Pending
        );
    }
}
