//! PostgreSQL ledger and dedup store for `drover` (companion crate).
//!
//! Four tables back the core interfaces: `tasks`, `task_progress`,
//! `agent_state`, and `message_dedup`. All statements are prepared (sqlx
//! caches them per connection), the pool is bounded by the ledger config,
//! filtered scans ride the `(status, created_at DESC)` and capability
//! indexes, and a cleanup task prunes progress rows past retention.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drover::config::LedgerConfig;
use drover::ledger::{AgentStateRecord, Ledger, LedgerStats, TaskPatch};
use drover::{
    DedupStore, Error, ErrorKind, ProgressEntry, Result, Task, TaskFailure, TaskFilter, TaskState,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    description   TEXT NOT NULL DEFAULT '',
    type          TEXT NOT NULL,
    priority      TEXT NOT NULL,
    status        TEXT NOT NULL,
    input         JSONB NOT NULL DEFAULT '{}'::jsonb,
    result        JSONB,
    error         JSONB,
    capabilities  TEXT[] NOT NULL DEFAULT '{}',
    dependencies  TEXT[] NOT NULL DEFAULT '{}',
    attempts      INTEGER NOT NULL DEFAULT 0,
    max_attempts  INTEGER NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL,
    started_at    TIMESTAMPTZ,
    completed_at  TIMESTAMPTZ,
    deadline_ms   BIGINT
);
CREATE INDEX IF NOT EXISTS tasks_status_created_idx ON tasks (status, created_at DESC);
CREATE INDEX IF NOT EXISTS tasks_capabilities_idx ON tasks USING GIN (capabilities);

CREATE TABLE IF NOT EXISTS task_progress (
    id        BIGSERIAL PRIMARY KEY,
    task_id   TEXT NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
    ts        TIMESTAMPTZ NOT NULL,
    state     TEXT NOT NULL,
    note      TEXT NOT NULL DEFAULT '',
    worker_id TEXT
);
CREATE INDEX IF NOT EXISTS task_progress_task_ts_idx ON task_progress (task_id, ts);

CREATE TABLE IF NOT EXISTS agent_state (
    id             TEXT PRIMARY KEY,
    capability     TEXT[] NOT NULL DEFAULT '{}',
    status         TEXT NOT NULL,
    last_heartbeat TIMESTAMPTZ NOT NULL,
    stats          JSONB NOT NULL DEFAULT 'null'::jsonb
);

CREATE TABLE IF NOT EXISTS message_dedup (
    message_id    TEXT PRIMARY KEY,
    first_seen_at TIMESTAMPTZ NOT NULL,
    expires_at    TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS message_dedup_expires_idx ON message_dedup (expires_at);
"#;

fn map_sqlx_err(context: &str, err: sqlx::Error) -> Error {
    Error::new(ErrorKind::Internal, format!("{context}: {err}"))
}

fn parse_state(raw: &str) -> Result<TaskState> {
    match raw {
        "pending" => Ok(TaskState::Pending),
        "assigned" => Ok(TaskState::Assigned),
        "running" => Ok(TaskState::Running),
        "completed" => Ok(TaskState::Completed),
        "failed" => Ok(TaskState::Failed),
        "cancelled" => Ok(TaskState::Cancelled),
        other => Err(Error::internal(format!("unknown task state '{other}' in ledger"))),
    }
}

fn parse_priority(raw: &str) -> drover::Priority {
    match raw {
        "low" => drover::Priority::Low,
        "high" => drover::Priority::High,
        "critical" => drover::Priority::Critical,
        _ => drover::Priority::Normal,
    }
}

fn priority_str(priority: drover::Priority) -> &'static str {
    match priority {
        drover::Priority::Low => "low",
        drover::Priority::Normal => "normal",
        drover::Priority::High => "high",
        drover::Priority::Critical => "critical",
    }
}

fn to_utc(ts: SystemTime) -> DateTime<Utc> {
    ts.into()
}

fn row_to_task(row: &PgRow) -> Result<Task> {
    let status = parse_state(row.try_get::<String, _>("status").map_err(|e| map_sqlx_err("status", e))?.as_str())?;
    let priority = parse_priority(
        row.try_get::<String, _>("priority").map_err(|e| map_sqlx_err("priority", e))?.as_str(),
    );
    let input: serde_json::Value =
        row.try_get("input").map_err(|e| map_sqlx_err("input", e))?;
    let error: Option<serde_json::Value> =
        row.try_get("error").map_err(|e| map_sqlx_err("error", e))?;
    let capabilities: Vec<String> =
        row.try_get("capabilities").map_err(|e| map_sqlx_err("capabilities", e))?;
    let deadline_ms: Option<i64> =
        row.try_get("deadline_ms").map_err(|e| map_sqlx_err("deadline_ms", e))?;

    Ok(Task {
        id: row.try_get("id").map_err(|e| map_sqlx_err("id", e))?,
        name: row.try_get("name").map_err(|e| map_sqlx_err("name", e))?,
        description: row.try_get("description").map_err(|e| map_sqlx_err("description", e))?,
        task_type: row.try_get("type").map_err(|e| map_sqlx_err("type", e))?,
        priority,
        input: match input {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        },
        required_capabilities: capabilities.into_iter().collect::<BTreeSet<String>>(),
        dependencies: row.try_get("dependencies").map_err(|e| map_sqlx_err("dependencies", e))?,
        status,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(|e| map_sqlx_err("created_at", e))?
            .into(),
        started_at: row
            .try_get::<Option<DateTime<Utc>>, _>("started_at")
            .map_err(|e| map_sqlx_err("started_at", e))?
            .map(Into::into),
        completed_at: row
            .try_get::<Option<DateTime<Utc>>, _>("completed_at")
            .map_err(|e| map_sqlx_err("completed_at", e))?
            .map(Into::into),
        deadline: deadline_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
        result: row.try_get("result").map_err(|e| map_sqlx_err("result", e))?,
        error: match error {
            Some(value) => serde_json::from_value::<TaskFailure>(value).ok(),
            None => None,
        },
        attempts: row.try_get::<i32, _>("attempts").map_err(|e| map_sqlx_err("attempts", e))? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(|e| map_sqlx_err("max_attempts", e))?
            as u32,
    })
}

/// Relational ledger on a bounded connection pool.
pub struct PostgresLedger {
    pool: PgPool,
    progress_retention: Duration,
}

impl PostgresLedger {
    /// Connect and apply the schema.
    pub async fn connect(config: &LedgerConfig) -> Result<Self> {
        config.validate()?;
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| Error::invalid_config("relational ledger requires a url"))?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await
            .map_err(|err| Error::invalid_config(format!("postgres connect: {err}")))?;
        let ledger = Self { pool, progress_retention: config.progress_retention };
        ledger.migrate().await?;
        Ok(ledger)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|err| map_sqlx_err("migrate", err))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Delete progress rows past retention. Returns rows removed.
    pub async fn cleanup_progress(&self) -> Result<u64> {
        let cutoff = to_utc(SystemTime::now() - self.progress_retention);
        let outcome = sqlx::query("DELETE FROM task_progress WHERE ts < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|err| map_sqlx_err("cleanup progress", err))?;
        Ok(outcome.rows_affected())
    }

    /// Periodic retention sweep.
    pub fn spawn_cleanup(self: &std::sync::Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let ledger = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match ledger.cleanup_progress().await {
                    Ok(removed) if removed > 0 => {
                        tracing::debug!(removed, "pruned old progress rows")
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "progress cleanup failed"),
                }
            }
        })
    }
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn create_task(&self, task: Task) -> Result<()> {
        task.validate()?;
        let capabilities: Vec<String> = task.required_capabilities.iter().cloned().collect();
        let outcome = sqlx::query(
            r#"INSERT INTO tasks
               (id, name, description, type, priority, status, input, result, error,
                capabilities, dependencies, attempts, max_attempts, created_at,
                started_at, completed_at, deadline_ms)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
               ON CONFLICT (id) DO NOTHING"#,
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(&task.description)
        .bind(&task.task_type)
        .bind(priority_str(task.priority))
        .bind(task.status.as_str())
        .bind(serde_json::Value::Object(task.input.clone()))
        .bind(&task.result)
        .bind(task.error.as_ref().and_then(|e| serde_json::to_value(e).ok()))
        .bind(&capabilities)
        .bind(&task.dependencies)
        .bind(task.attempts as i32)
        .bind(task.max_attempts as i32)
        .bind(to_utc(task.created_at))
        .bind(task.started_at.map(to_utc))
        .bind(task.completed_at.map(to_utc))
        .bind(task.deadline.map(|d| d.as_millis() as i64))
        .execute(&self.pool)
        .await
        .map_err(|err| map_sqlx_err("create task", err))?;

        if outcome.rows_affected() == 0 {
            return Err(Error::already_exists(format!("task '{}' already exists", task.id)));
        }
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| map_sqlx_err("get task", err))?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        // Row-level guard: read the status under lock, validate the
        // transition, write, all in one transaction.
        let mut tx = self.pool.begin().await.map_err(|err| map_sqlx_err("begin", err))?;
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM tasks WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|err| map_sqlx_err("lock task", err))?;
        let current = parse_state(
            &current.ok_or_else(|| Error::not_found(format!("task '{id}' not found")))?,
        )?;
        if let Some(next) = patch.status {
            if !current.may_become(next) {
                return Err(Error::invalid_input(format!(
                    "task '{id}' cannot transition {current} -> {next}"
                )));
            }
        }

        let row = sqlx::query(
            r#"UPDATE tasks SET
                 status = COALESCE($2, status),
                 started_at = COALESCE($3, started_at),
                 completed_at = COALESCE($4, completed_at),
                 result = COALESCE($5, result),
                 error = COALESCE($6, error),
                 attempts = COALESCE($7, attempts)
               WHERE id = $1
               RETURNING *"#,
        )
        .bind(id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.started_at.map(to_utc))
        .bind(patch.completed_at.map(to_utc))
        .bind(&patch.result)
        .bind(patch.error.as_ref().and_then(|e| serde_json::to_value(e).ok()))
        .bind(patch.attempts.map(|a| a as i32))
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| map_sqlx_err("update task", err))?;
        tx.commit().await.map_err(|err| map_sqlx_err("commit", err))?;
        row_to_task(&row)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM tasks WHERE TRUE");
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(capability) = &filter.capability {
            builder.push(" AND ").push_bind(capability.clone()).push(" = ANY(capabilities)");
        }
        if let Some(after) = filter.created_after {
            builder.push(" AND created_at >= ").push_bind(to_utc(after));
        }
        if let Some(before) = filter.created_before {
            builder.push(" AND created_at < ").push_bind(to_utc(before));
        }
        builder
            .push(" ORDER BY created_at DESC, id ASC LIMIT ")
            .push_bind(filter.limit as i64)
            .push(" OFFSET ")
            .push_bind(filter.offset as i64);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|err| map_sqlx_err("list tasks", err))?;
        rows.iter().map(row_to_task).collect()
    }

    async fn append_progress(&self, entry: ProgressEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_progress (task_id, ts, state, note, worker_id) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&entry.task_id)
        .bind(to_utc(entry.timestamp))
        .bind(entry.state.as_str())
        .bind(&entry.note)
        .bind(&entry.worker_id)
        .execute(&self.pool)
        .await
        .map_err(|err| map_sqlx_err("append progress", err))?;
        Ok(())
    }

    async fn progress(&self, task_id: &str) -> Result<Vec<ProgressEntry>> {
        let rows = sqlx::query(
            "SELECT task_id, ts, state, note, worker_id FROM task_progress \
             WHERE task_id = $1 ORDER BY ts ASC, id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| map_sqlx_err("progress", err))?;

        rows.into_iter()
            .map(|row| {
                Ok(ProgressEntry {
                    task_id: row.try_get("task_id").map_err(|e| map_sqlx_err("task_id", e))?,
                    timestamp: row
                        .try_get::<DateTime<Utc>, _>("ts")
                        .map_err(|e| map_sqlx_err("ts", e))?
                        .into(),
                    state: parse_state(
                        row.try_get::<String, _>("state")
                            .map_err(|e| map_sqlx_err("state", e))?
                            .as_str(),
                    )?,
                    note: row.try_get("note").map_err(|e| map_sqlx_err("note", e))?,
                    worker_id: row.try_get("worker_id").map_err(|e| map_sqlx_err("worker_id", e))?,
                })
            })
            .collect()
    }

    async fn upsert_agent_state(&self, state: AgentStateRecord) -> Result<()> {
        let capabilities: Vec<String> = state.capabilities.iter().cloned().collect();
        sqlx::query(
            r#"INSERT INTO agent_state (id, capability, status, last_heartbeat, stats)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (id) DO UPDATE SET
                 capability = EXCLUDED.capability,
                 status = EXCLUDED.status,
                 last_heartbeat = EXCLUDED.last_heartbeat,
                 stats = EXCLUDED.stats"#,
        )
        .bind(&state.agent_id)
        .bind(&capabilities)
        .bind(&state.status)
        .bind(to_utc(state.last_heartbeat))
        .bind(&state.stats)
        .execute(&self.pool)
        .await
        .map_err(|err| map_sqlx_err("upsert agent", err))?;
        Ok(())
    }

    async fn agent_states(&self) -> Result<Vec<AgentStateRecord>> {
        let rows = sqlx::query("SELECT * FROM agent_state ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|err| map_sqlx_err("agent states", err))?;
        rows.into_iter()
            .map(|row| {
                let capabilities: Vec<String> =
                    row.try_get("capability").map_err(|e| map_sqlx_err("capability", e))?;
                Ok(AgentStateRecord {
                    agent_id: row.try_get("id").map_err(|e| map_sqlx_err("id", e))?,
                    capabilities: capabilities.into_iter().collect(),
                    status: row.try_get("status").map_err(|e| map_sqlx_err("status", e))?,
                    last_heartbeat: row
                        .try_get::<DateTime<Utc>, _>("last_heartbeat")
                        .map_err(|e| map_sqlx_err("last_heartbeat", e))?
                        .into(),
                    stats: row.try_get("stats").map_err(|e| map_sqlx_err("stats", e))?,
                })
            })
            .collect()
    }

    async fn stats(&self) -> Result<LedgerStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(|err| map_sqlx_err("stats", err))?;
        let mut stats = LedgerStats::default();
        for (status, count) in rows {
            let count = count as usize;
            stats.total += count;
            match parse_state(&status)? {
                TaskState::Pending => stats.pending += count,
                TaskState::Assigned => stats.assigned += count,
                TaskState::Running => stats.running += count,
                TaskState::Completed => stats.completed += count,
                TaskState::Failed => stats.failed += count,
                TaskState::Cancelled => stats.cancelled += count,
            }
        }
        Ok(stats)
    }

    async fn health(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|err| map_sqlx_err("health", err))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Dedup store on the `message_dedup` table; expiry is enforced in SQL so
/// concurrent inserts arbitrate on the primary key.
pub struct PostgresDedupStore {
    pool: PgPool,
}

impl PostgresDedupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Share the ledger's pool.
    pub fn from_ledger(ledger: &PostgresLedger) -> Self {
        Self { pool: ledger.pool().clone() }
    }
}

#[async_trait]
impl DedupStore for PostgresDedupStore {
    async fn insert_if_absent(&self, id: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|_| Error::invalid_config("dedup ttl too large"))?;
        let outcome = sqlx::query(
            r#"INSERT INTO message_dedup (message_id, first_seen_at, expires_at)
               VALUES ($1, $2, $3)
               ON CONFLICT (message_id) DO UPDATE SET
                 first_seen_at = EXCLUDED.first_seen_at,
                 expires_at = EXCLUDED.expires_at
               WHERE message_dedup.expires_at <= NOW()"#,
        )
        .bind(id)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|err| map_sqlx_err("dedup insert", err))?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        let live: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM message_dedup WHERE message_id = $1 AND expires_at > NOW()",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| map_sqlx_err("dedup contains", err))?;
        Ok(live.is_some())
    }

    async fn remove_expired(&self) -> Result<usize> {
        let outcome = sqlx::query("DELETE FROM message_dedup WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(|err| map_sqlx_err("dedup sweep", err))?;
        Ok(outcome.rows_affected() as usize)
    }

    async fn live_ids(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT message_id FROM message_dedup WHERE expires_at > NOW()")
            .fetch_all(&self.pool)
            .await
            .map_err(|err| map_sqlx_err("dedup live ids", err))
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM message_dedup")
            .fetch_one(&self.pool)
            .await
            .map_err(|err| map_sqlx_err("dedup len", err))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_round_trip_through_text() {
        for state in [
            TaskState::Pending,
            TaskState::Assigned,
            TaskState::Running,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Cancelled,
        ] {
            assert_eq!(parse_state(state.as_str()).unwrap(), state);
        }
        assert!(parse_state("paused").is_err());
    }

    #[test]
    fn priorities_round_trip_through_text() {
        for priority in [
            drover::Priority::Low,
            drover::Priority::Normal,
            drover::Priority::High,
            drover::Priority::Critical,
        ] {
            assert_eq!(parse_priority(priority_str(priority)), priority);
        }
    }

    #[test]
    fn schema_covers_the_four_tables() {
        for table in ["tasks", "task_progress", "agent_state", "message_dedup"] {
            assert!(SCHEMA.contains(table), "schema missing {table}");
        }
        assert!(SCHEMA.contains("status, created_at DESC"));
        assert!(SCHEMA.contains("expires_at"));
    }
}
