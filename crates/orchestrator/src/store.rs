//! Durable run index and per-run event log.
//!
//! Two tables: `runs` (one row per run, status machine enforced by guarded
//! updates) and `run_events` (append-only, sharded by run id). A status
//! transition is a single statement, so a crash can never leave a run
//! half-moved.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{info, warn};

use model::{EventRecord, Run, RunStatus};

use crate::error::OrchestratorError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    config      TEXT NOT NULL,
    status      TEXT NOT NULL,
    progress    REAL NOT NULL DEFAULT 0,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    finished_at INTEGER,
    last_error  TEXT
);
CREATE TABLE IF NOT EXISTS run_events (
    run_id      TEXT NOT NULL,
    seq         INTEGER NOT NULL,
    occurred_at INTEGER NOT NULL,
    record      TEXT NOT NULL,
    PRIMARY KEY (run_id, seq)
);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status, created_at);
"#;

/// SQLite-backed run store.
#[derive(Debug, Clone)]
pub struct RunStore {
    pool: SqlitePool,
}

impl RunStore {
    pub async fn connect(path: &Path) -> Result<Self, OrchestratorError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self, OrchestratorError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self, OrchestratorError> {
        let store = Self { pool };
        // The schema is several statements; raw_sql runs them all.
        sqlx::raw_sql(SCHEMA).execute(&store.pool).await?;
        Ok(store)
    }

    /// Persist a new pending run and return it.
    pub async fn create(
        &self,
        name: &str,
        config: &serde_json::Value,
    ) -> Result<Run, OrchestratorError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO runs (id, name, config, status, progress, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4)",
        )
        .bind(&id)
        .bind(name)
        .bind(serde_json::to_string(config)?)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;
        self.get(&id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownRun(id))
    }

    pub async fn get(&self, run_id: &str) -> Result<Option<Run>, OrchestratorError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    /// All runs, newest first.
    pub async fn list(&self) -> Result<Vec<Run>, OrchestratorError> {
        let rows = sqlx::query("SELECT * FROM runs ORDER BY created_at DESC, id DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    /// Advance a run's status, enforcing the monotonic machine. The guard
    /// is in the UPDATE itself, so concurrent transitions cannot race.
    pub async fn transition(
        &self,
        run_id: &str,
        to: RunStatus,
        error: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let current = self
            .get(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownRun(run_id.to_string()))?;
        if !current.status.allows(to) {
            return Err(OrchestratorError::InvalidState {
                run_id: run_id.to_string(),
                status: current.status.to_string(),
            });
        }
        let now = Utc::now().timestamp_millis();
        let finished_at = to.is_terminal().then_some(now);
        let updated = sqlx::query(
            "UPDATE runs
             SET status = ?1, last_error = COALESCE(?2, last_error), updated_at = ?3,
                 finished_at = COALESCE(?4, finished_at)
             WHERE id = ?5 AND status = ?6",
        )
        .bind(to.as_str())
        .bind(error)
        .bind(now)
        .bind(finished_at)
        .bind(run_id)
        .bind(current.status.as_str())
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(OrchestratorError::InvalidState {
                run_id: run_id.to_string(),
                status: current.status.to_string(),
            });
        }
        info!(run_id, from = %current.status, to = %to, "run status transition");
        Ok(())
    }

    pub async fn set_progress(&self, run_id: &str, progress: f64) -> Result<(), OrchestratorError> {
        sqlx::query(
            "UPDATE runs SET progress = ?1, updated_at = ?2 WHERE id = ?3 AND status = 'running'",
        )
        .bind(progress.clamp(0.0, 1.0))
        .bind(Utc::now().timestamp_millis())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append one event to the run's durable log. Replays of the same
    /// sequence number are ignored, keeping the log append-only.
    pub async fn append_event(
        &self,
        run_id: &str,
        record: &EventRecord,
    ) -> Result<(), OrchestratorError> {
        sqlx::query(
            "INSERT OR IGNORE INTO run_events (run_id, seq, occurred_at, record)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(run_id)
        .bind(record.seq as i64)
        .bind(record.occurred_at.timestamp_millis())
        .bind(serde_json::to_string(record)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The last `limit` events for a run, in sequence order.
    pub async fn recent_events(
        &self,
        run_id: &str,
        limit: u32,
    ) -> Result<Vec<EventRecord>, OrchestratorError> {
        let rows = sqlx::query(
            "SELECT record FROM run_events WHERE run_id = ?1 ORDER BY seq DESC LIMIT ?2",
        )
        .bind(run_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            let raw: String = row.get("record");
            events.push(serde_json::from_str(&raw)?);
        }
        Ok(events)
    }

    /// Startup recovery: any run the previous controller left live is
    /// marked failed with a recovery note. Its partial event log survives.
    pub async fn recover_incomplete(&self) -> Result<u64, OrchestratorError> {
        let updated = sqlx::query(
            "UPDATE runs
             SET status = 'failed',
                 last_error = 'controller restarted while run was live',
                 updated_at = ?1, finished_at = ?1
             WHERE status IN ('running', 'pending')",
        )
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        let recovered = updated.rows_affected();
        if recovered > 0 {
            warn!(recovered, "marked interrupted runs as failed on startup");
        }
        Ok(recovered)
    }

    /// Retention: drop terminal runs beyond the `keep_last` most recent,
    /// events included.
    pub async fn evict_finished(&self, keep_last: u32) -> Result<u64, OrchestratorError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT id FROM runs
             WHERE status IN ('succeeded', 'failed', 'canceled')
             ORDER BY created_at DESC, id DESC
             LIMIT -1 OFFSET ?1",
        )
        .bind(keep_last as i64)
        .fetch_all(&mut *tx)
        .await?;
        let mut evicted = 0;
        for row in rows {
            let id: String = row.get("id");
            sqlx::query("DELETE FROM run_events WHERE run_id = ?1")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM runs WHERE id = ?1")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            evicted += 1;
        }
        tx.commit().await?;
        Ok(evicted)
    }
}

fn run_from_row(row: &SqliteRow) -> Result<Run, OrchestratorError> {
    let status: String = row.get("status");
    let config: String = row.get("config");
    let created_at: i64 = row.get("created_at");
    let updated_at: i64 = row.get("updated_at");
    let finished_at: Option<i64> = row.get("finished_at");
    let to_time = |millis: i64| {
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH)
    };
    Ok(Run {
        id: row.get("id"),
        name: row.get("name"),
        config: serde_json::from_str(&config)?,
        status: status.parse().map_err(OrchestratorError::Corrupt)?,
        progress: row.get("progress"),
        created_at: to_time(created_at),
        updated_at: to_time(updated_at),
        finished_at: finished_at.map(to_time),
        last_error: row.get("last_error"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{Event, EventKind, MetricsEvent};
    use serde_json::json;

    fn event(seq: u64) -> EventRecord {
        EventRecord {
            seq,
            kind: EventKind::Metrics,
            occurred_at: Utc.timestamp_opt(1_704_153_600, 0).unwrap(),
            run_id: "run".into(),
            symbol_seq: None,
            trace_id: format!("t-{seq}"),
            payload: Event::Metrics(MetricsEvent {
                equity: Default::default(),
                cash: Default::default(),
                realized_pnl: Default::default(),
                unrealized_pnl: Default::default(),
                holdings: Default::default(),
            }),
        }
    }

    #[tokio::test]
    async fn create_transition_and_fetch() {
        let store = RunStore::in_memory().await.unwrap();
        let run = store.create("demo", &json!({"name": "demo"})).await.unwrap();
        assert_eq!(run.status, RunStatus::Pending);

        store.transition(&run.id, RunStatus::Running, None).await.unwrap();
        store
            .transition(&run.id, RunStatus::Succeeded, None)
            .await
            .unwrap();

        let stored = store.get(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let store = RunStore::in_memory().await.unwrap();
        let run = store.create("demo", &json!({})).await.unwrap();

        // pending -> succeeded skips running.
        assert!(store
            .transition(&run.id, RunStatus::Succeeded, None)
            .await
            .is_err());

        store.transition(&run.id, RunStatus::Running, None).await.unwrap();
        store.transition(&run.id, RunStatus::Failed, Some("boom")).await.unwrap();
        // Terminal runs are immutable.
        assert!(store
            .transition(&run.id, RunStatus::Running, None)
            .await
            .is_err());

        let stored = store.get(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn event_log_is_append_only_and_replayable() {
        let store = RunStore::in_memory().await.unwrap();
        let run = store.create("demo", &json!({})).await.unwrap();
        for seq in 0..20 {
            store.append_event(&run.id, &event(seq)).await.unwrap();
        }
        // Replaying a sequence number is a no-op.
        store.append_event(&run.id, &event(5)).await.unwrap();

        let recent = store.recent_events(&run.id, 5).await.unwrap();
        let seqs: Vec<u64> = recent.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![15, 16, 17, 18, 19]);
    }

    #[tokio::test]
    async fn startup_recovery_fails_live_runs() {
        let store = RunStore::in_memory().await.unwrap();
        let live = store.create("live", &json!({})).await.unwrap();
        store.transition(&live.id, RunStatus::Running, None).await.unwrap();
        let queued = store.create("queued", &json!({})).await.unwrap();
        let done = store.create("done", &json!({})).await.unwrap();
        store.transition(&done.id, RunStatus::Running, None).await.unwrap();
        store.transition(&done.id, RunStatus::Succeeded, None).await.unwrap();

        assert_eq!(store.recover_incomplete().await.unwrap(), 2);
        assert_eq!(
            store.get(&live.id).await.unwrap().unwrap().status,
            RunStatus::Failed
        );
        assert_eq!(
            store.get(&queued.id).await.unwrap().unwrap().status,
            RunStatus::Failed
        );
        assert_eq!(
            store.get(&done.id).await.unwrap().unwrap().status,
            RunStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn retention_evicts_oldest_terminal_runs() {
        let store = RunStore::in_memory().await.unwrap();
        let mut ids = Vec::new();
        for index in 0..5 {
            let run = store.create(&format!("run-{index}"), &json!({})).await.unwrap();
            store.transition(&run.id, RunStatus::Running, None).await.unwrap();
            store.transition(&run.id, RunStatus::Succeeded, None).await.unwrap();
            store.append_event(&run.id, &event(0)).await.unwrap();
            ids.push(run.id);
        }

        let evicted = store.evict_finished(3).await.unwrap();
        assert_eq!(evicted, 2);
        assert_eq!(store.list().await.unwrap().len(), 3);
    }
}
