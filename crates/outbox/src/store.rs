//! The durable outbox table.
//!
//! SQLite-backed, one row per intent. Every status transition is a single
//! guarded UPDATE, so concurrent dispatchers can share the table without
//! ever holding overlapping leases.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info, warn};

use common::ExponentialBackoff;

use crate::channel::SendOutcome;
use crate::error::OutboxError;
use crate::intent::{IntentStatus, IntentType, NewIntent, NotificationIntent};

/// Retry shape applied by `mark_failed`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after which an intent dead-letters.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter fraction applied to computed delays.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(900),
            jitter: 0.1,
        }
    }
}

/// Result of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new row was inserted.
    Inserted(String),
    /// A live intent with the same dedupe key already exists; its id is
    /// returned and nothing was written.
    Deduplicated(String),
}

impl EnqueueOutcome {
    pub fn id(&self) -> &str {
        match self {
            Self::Inserted(id) | Self::Deduplicated(id) => id,
        }
    }
}

/// Counts surfaced for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxMetrics {
    pub pending: u64,
    pub leased: u64,
    pub sent: u64,
    pub dead_letter: u64,
    /// Age of the oldest pending intent, in seconds.
    pub oldest_pending_secs: Option<i64>,
}

impl OutboxMetrics {
    pub fn total(&self) -> u64 {
        self.pending + self.leased + self.sent + self.dead_letter
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS outbox (
    id            TEXT PRIMARY KEY,
    dedupe_key    TEXT NOT NULL,
    intent_type   TEXT NOT NULL,
    severity      TEXT NOT NULL,
    payload       TEXT NOT NULL,
    channel       TEXT NOT NULL,
    status        TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    next_retry_at INTEGER,
    last_error    TEXT,
    created_at    INTEGER NOT NULL,
    leased_until  INTEGER
);
CREATE INDEX IF NOT EXISTS idx_outbox_dedupe ON outbox(dedupe_key, status, created_at);
CREATE INDEX IF NOT EXISTS idx_outbox_lease ON outbox(status, next_retry_at, created_at);
"#;

/// Durable queue of notification intents.
#[derive(Debug, Clone)]
pub struct Outbox {
    pool: SqlitePool,
    policy: RetryPolicy,
}

impl Outbox {
    /// Open (creating if missing) an outbox at `path`.
    pub async fn connect(path: &Path, policy: RetryPolicy) -> Result<Self, OutboxError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, policy).await
    }

    /// In-memory outbox for tests; a single connection so every handle
    /// sees the same database.
    pub async fn in_memory(policy: RetryPolicy) -> Result<Self, OutboxError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool, policy).await
    }

    pub async fn with_pool(pool: SqlitePool, policy: RetryPolicy) -> Result<Self, OutboxError> {
        let outbox = Self { pool, policy };
        outbox.init().await?;
        Ok(outbox)
    }

    async fn init(&self) -> Result<(), OutboxError> {
        // The schema is several statements; raw_sql runs them all.
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert an intent unless a live duplicate exists.
    ///
    /// A duplicate is a row with the same dedupe key in `pending` or
    /// `leased` status created within the dedupe TTL. The insert is the
    /// durability boundary: once this returns `Inserted`, the system owes
    /// at-least-once attempted delivery or a dead letter.
    pub async fn enqueue(
        &self,
        intent: NewIntent,
        dedupe_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, OutboxError> {
        let cutoff = now.timestamp_millis() - dedupe_ttl.as_millis() as i64;
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT id FROM outbox
             WHERE dedupe_key = ?1 AND status IN ('pending', 'leased') AND created_at >= ?2
             LIMIT 1",
        )
        .bind(&intent.dedupe_key)
        .bind(cutoff)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let id: String = row.get("id");
            tx.commit().await?;
            debug!(dedupe_key = %intent.dedupe_key, existing = %id, "intent deduplicated");
            return Ok(EnqueueOutcome::Deduplicated(id));
        }

        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO outbox
             (id, dedupe_key, intent_type, severity, payload, channel, status,
              attempt_count, next_retry_at, last_error, created_at, leased_until)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, NULL, NULL, ?7, NULL)",
        )
        .bind(&id)
        .bind(&intent.dedupe_key)
        .bind(intent.intent_type.as_str())
        .bind(intent.severity.as_str())
        .bind(serde_json::to_string(&intent.payload)?)
        .bind(&intent.channel)
        .bind(now.timestamp_millis())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(EnqueueOutcome::Inserted(id))
    }

    /// Atomically claim up to `batch_size` due intents.
    ///
    /// Each row is moved `pending -> leased` with a guarded UPDATE, so two
    /// dispatchers can never hold the same intent.
    pub async fn lease(
        &self,
        batch_size: u32,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationIntent>, OutboxError> {
        let now_ms = now.timestamp_millis();
        let leased_until = now_ms + lease_duration.as_millis() as i64;
        let mut tx = self.pool.begin().await?;

        let candidates = sqlx::query(
            "SELECT id FROM outbox
             WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?1)
             ORDER BY created_at ASC, id ASC
             LIMIT ?2",
        )
        .bind(now_ms)
        .bind(batch_size as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for row in candidates {
            let id: String = row.get("id");
            let updated = sqlx::query(
                "UPDATE outbox SET status = 'leased', leased_until = ?1
                 WHERE id = ?2 AND status = 'pending'",
            )
            .bind(leased_until)
            .bind(&id)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 1 {
                claimed.push(id);
            }
        }

        let mut intents = Vec::with_capacity(claimed.len());
        for id in claimed {
            let row = sqlx::query("SELECT * FROM outbox WHERE id = ?1")
                .bind(&id)
                .fetch_one(&mut *tx)
                .await?;
            intents.push(intent_from_row(&row)?);
        }
        tx.commit().await?;
        Ok(intents)
    }

    /// Transition `leased -> sent`. A repeat call is a no-op and returns
    /// false.
    pub async fn mark_sent(&self, id: &str, _now: DateTime<Utc>) -> Result<bool, OutboxError> {
        let updated = sqlx::query(
            "UPDATE outbox SET status = 'sent', leased_until = NULL
             WHERE id = ?1 AND status = 'leased'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    /// Record a failed delivery attempt.
    ///
    /// Increments the attempt counter, then either reschedules (bounded
    /// exponential backoff, pushed later by any server-indicated
    /// `retry_after`) or dead-letters when the attempt budget is spent or
    /// the failure is permanent.
    pub async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        permanent: bool,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<IntentStatus, OutboxError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT attempt_count FROM outbox WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| OutboxError::UnknownIntent(id.to_string()))?;
        let attempts: i64 = row.get("attempt_count");
        let attempts = attempts as u32 + 1;

        let dead = permanent || attempts >= self.policy.max_attempts;
        let status = if dead {
            sqlx::query(
                "UPDATE outbox
                 SET status = 'dead_letter', attempt_count = ?1, last_error = ?2,
                     next_retry_at = NULL, leased_until = NULL
                 WHERE id = ?3",
            )
            .bind(attempts as i64)
            .bind(error)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            warn!(intent = id, attempts, %error, "intent dead-lettered");
            IntentStatus::DeadLetter
        } else {
            let backoff = ExponentialBackoff::new(
                self.policy.base_delay,
                self.policy.max_delay,
                self.policy.jitter,
            );
            let mut delay = backoff.delay_for_attempt(attempts.saturating_sub(1));
            if let Some(hint) = retry_after {
                // Honor a server-indicated back-off window: never retry
                // earlier than it allows.
                delay = delay.max(hint);
            }
            let next_retry = now.timestamp_millis() + delay.as_millis() as i64;
            sqlx::query(
                "UPDATE outbox
                 SET status = 'pending', attempt_count = ?1, last_error = ?2,
                     next_retry_at = ?3, leased_until = NULL
                 WHERE id = ?4",
            )
            .bind(attempts as i64)
            .bind(error)
            .bind(next_retry)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            debug!(intent = id, attempts, delay_ms = delay.as_millis() as u64, "intent rescheduled");
            IntentStatus::Pending
        };
        tx.commit().await?;
        Ok(status)
    }

    /// Map a channel send outcome onto the matching transition.
    pub async fn record_outcome(
        &self,
        id: &str,
        outcome: &SendOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        match outcome {
            SendOutcome::Ok => {
                self.mark_sent(id, now).await?;
            }
            SendOutcome::Retryable { reason, retry_after } => {
                self.mark_failed(id, reason, false, *retry_after, now).await?;
            }
            SendOutcome::Permanent { reason } => {
                self.mark_failed(id, reason, true, None, now).await?;
            }
        }
        Ok(())
    }

    /// Return expired leases to `pending`, attempt counts preserved. Run
    /// on startup and periodically; guarantees no intent is stranded by a
    /// crashed dispatcher.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<u64, OutboxError> {
        let updated = sqlx::query(
            "UPDATE outbox SET status = 'pending', leased_until = NULL
             WHERE status = 'leased' AND leased_until < ?1",
        )
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;
        let recovered = updated.rows_affected();
        if recovered > 0 {
            info!(recovered, "expired leases released");
        }
        Ok(recovered)
    }

    pub async fn metrics(&self, now: DateTime<Utc>) -> Result<OutboxMetrics, OutboxError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM outbox GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut metrics = OutboxMetrics::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("n");
            match status.as_str() {
                "pending" => metrics.pending = count as u64,
                "leased" => metrics.leased = count as u64,
                "sent" => metrics.sent = count as u64,
                "dead_letter" => metrics.dead_letter = count as u64,
                other => return Err(OutboxError::Corrupt(format!("status {other}"))),
            }
        }
        let oldest = sqlx::query(
            "SELECT MIN(created_at) AS oldest FROM outbox WHERE status = 'pending'",
        )
        .fetch_one(&self.pool)
        .await?;
        let oldest: Option<i64> = oldest.get("oldest");
        metrics.oldest_pending_secs =
            oldest.map(|millis| (now.timestamp_millis() - millis) / 1000);
        Ok(metrics)
    }

    /// Fetch one intent by id.
    pub async fn get(&self, id: &str) -> Result<Option<NotificationIntent>, OutboxError> {
        let row = sqlx::query("SELECT * FROM outbox WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(intent_from_row).transpose()
    }
}

fn intent_from_row(row: &SqliteRow) -> Result<NotificationIntent, OutboxError> {
    let parse_time = |millis: Option<i64>| -> Option<DateTime<Utc>> {
        millis.and_then(|m| Utc.timestamp_millis_opt(m).single())
    };
    let intent_type: String = row.get("intent_type");
    let severity: String = row.get("severity");
    let status: String = row.get("status");
    let payload: String = row.get("payload");
    let created_at: i64 = row.get("created_at");
    let attempt_count: i64 = row.get("attempt_count");

    Ok(NotificationIntent {
        id: row.get("id"),
        dedupe_key: row.get("dedupe_key"),
        intent_type: intent_type
            .parse::<IntentType>()
            .map_err(OutboxError::Corrupt)?,
        severity: severity.parse().map_err(OutboxError::Corrupt)?,
        payload: serde_json::from_str(&payload)?,
        channel: row.get("channel"),
        status: status
            .parse::<IntentStatus>()
            .map_err(OutboxError::Corrupt)?,
        attempt_count: attempt_count as u32,
        next_retry_at: parse_time(row.get("next_retry_at")),
        last_error: row.get("last_error"),
        created_at: parse_time(Some(created_at))
            .ok_or_else(|| OutboxError::Corrupt(format!("created_at {created_at}")))?,
        leased_until: parse_time(row.get("leased_until")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::Severity;
    use serde_json::json;

    fn policy_no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(900),
            jitter: 0.0,
        }
    }

    fn intent(key: &str) -> NewIntent {
        NewIntent {
            dedupe_key: key.to_string(),
            intent_type: IntentType::StrategySignal,
            severity: Severity::Info,
            payload: json!({"message": "SIGNAL SPY long"}),
            channel: "chat".to_string(),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_704_153_600 + secs, 0).unwrap()
    }

    const TTL: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn dedupe_window_collapses() {
        let outbox = Outbox::in_memory(policy_no_jitter(8)).await.unwrap();
        let first = outbox.enqueue(intent("k"), TTL, at(0)).await.unwrap();
        assert!(matches!(first, EnqueueOutcome::Inserted(_)));

        for step in 1..10 {
            let outcome = outbox.enqueue(intent("k"), TTL, at(step)).await.unwrap();
            assert_eq!(outcome, EnqueueOutcome::Deduplicated(first.id().to_string()));
        }
        assert_eq!(outbox.metrics(at(10)).await.unwrap().total(), 1);

        // Outside the TTL a fresh intent persists.
        let later = outbox.enqueue(intent("k"), TTL, at(301)).await.unwrap();
        assert!(matches!(later, EnqueueOutcome::Inserted(_)));
        assert_eq!(outbox.metrics(at(301)).await.unwrap().total(), 2);
    }

    #[tokio::test]
    async fn leases_never_overlap() {
        let outbox = Outbox::in_memory(policy_no_jitter(8)).await.unwrap();
        for index in 0..6 {
            outbox
                .enqueue(intent(&format!("k{index}")), TTL, at(index))
                .await
                .unwrap();
        }

        let first = outbox.lease(4, Duration::from_secs(60), at(10)).await.unwrap();
        let second = outbox.lease(4, Duration::from_secs(60), at(10)).await.unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 2);

        let first_ids: Vec<&str> = first.iter().map(|i| i.id.as_str()).collect();
        assert!(second.iter().all(|i| !first_ids.contains(&i.id.as_str())));

        // Everything is leased now; nothing left to claim.
        let third = outbox.lease(4, Duration::from_secs(60), at(10)).await.unwrap();
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn leases_claim_oldest_first() {
        let outbox = Outbox::in_memory(policy_no_jitter(8)).await.unwrap();
        outbox.enqueue(intent("young"), TTL, at(100)).await.unwrap();
        outbox.enqueue(intent("old"), TTL, at(0)).await.unwrap();

        let batch = outbox.lease(1, Duration::from_secs(60), at(200)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].dedupe_key, "old");
    }

    #[tokio::test]
    async fn mark_sent_is_idempotent() {
        let outbox = Outbox::in_memory(policy_no_jitter(8)).await.unwrap();
        let id = outbox
            .enqueue(intent("k"), TTL, at(0))
            .await
            .unwrap()
            .id()
            .to_string();
        outbox.lease(1, Duration::from_secs(60), at(1)).await.unwrap();

        assert!(outbox.mark_sent(&id, at(2)).await.unwrap());
        assert!(!outbox.mark_sent(&id, at(3)).await.unwrap());
        assert_eq!(
            outbox.get(&id).await.unwrap().unwrap().status,
            IntentStatus::Sent
        );
    }

    #[tokio::test]
    async fn retryable_failure_backs_off_then_redelivers() {
        let outbox = Outbox::in_memory(policy_no_jitter(8)).await.unwrap();
        let id = outbox
            .enqueue(intent("k"), TTL, at(0))
            .await
            .unwrap()
            .id()
            .to_string();
        outbox.lease(1, Duration::from_secs(60), at(1)).await.unwrap();

        let status = outbox
            .mark_failed(&id, "http 503", false, None, at(1))
            .await
            .unwrap();
        assert_eq!(status, IntentStatus::Pending);

        let stored = outbox.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.next_retry_at.unwrap() > at(1));

        // Not due yet (base delay 5s)...
        assert!(outbox
            .lease(1, Duration::from_secs(60), at(2))
            .await
            .unwrap()
            .is_empty());
        // ...but due after the backoff.
        assert_eq!(
            outbox
                .lease(1, Duration::from_secs(60), at(7))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn retry_after_hint_pushes_schedule_later() {
        let outbox = Outbox::in_memory(policy_no_jitter(8)).await.unwrap();
        let id = outbox
            .enqueue(intent("k"), TTL, at(0))
            .await
            .unwrap()
            .id()
            .to_string();
        outbox.lease(1, Duration::from_secs(60), at(1)).await.unwrap();
        outbox
            .mark_failed(&id, "rate limited", false, Some(Duration::from_secs(120)), at(1))
            .await
            .unwrap();

        let stored = outbox.get(&id).await.unwrap().unwrap();
        assert!(stored.next_retry_at.unwrap() >= at(121));
    }

    #[tokio::test]
    async fn attempt_budget_exhaustion_dead_letters() {
        let outbox = Outbox::in_memory(policy_no_jitter(2)).await.unwrap();
        let id = outbox
            .enqueue(intent("k"), TTL, at(0))
            .await
            .unwrap()
            .id()
            .to_string();

        outbox.lease(1, Duration::from_secs(60), at(1)).await.unwrap();
        assert_eq!(
            outbox.mark_failed(&id, "boom", false, None, at(1)).await.unwrap(),
            IntentStatus::Pending
        );
        outbox.lease(1, Duration::from_secs(60), at(10)).await.unwrap();
        assert_eq!(
            outbox.mark_failed(&id, "boom", false, None, at(10)).await.unwrap(),
            IntentStatus::DeadLetter
        );

        let stored = outbox.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 2);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_immediately() {
        let outbox = Outbox::in_memory(policy_no_jitter(8)).await.unwrap();
        let id = outbox
            .enqueue(intent("k"), TTL, at(0))
            .await
            .unwrap()
            .id()
            .to_string();
        outbox.lease(1, Duration::from_secs(60), at(1)).await.unwrap();

        assert_eq!(
            outbox
                .mark_failed(&id, "unknown recipient", true, None, at(1))
                .await
                .unwrap(),
            IntentStatus::DeadLetter
        );
    }

    #[tokio::test]
    async fn recovery_preserves_every_intent() {
        let outbox = Outbox::in_memory(policy_no_jitter(8)).await.unwrap();
        for index in 0..10 {
            outbox
                .enqueue(intent(&format!("k{index}")), TTL, at(index))
                .await
                .unwrap();
        }
        let before = outbox.metrics(at(20)).await.unwrap();

        // A dispatcher leases half the queue and crashes.
        let leased = outbox.lease(5, Duration::from_secs(30), at(20)).await.unwrap();
        assert_eq!(leased.len(), 5);

        // After the lease expires, recovery releases them with attempts
        // preserved and nothing lost.
        let recovered = outbox.recover(at(51)).await.unwrap();
        assert_eq!(recovered, 5);
        let after = outbox.metrics(at(51)).await.unwrap();
        assert_eq!(after.total(), before.total());
        assert_eq!(after.pending, 10);
        assert_eq!(after.leased, 0);

        // An unexpired lease is left alone.
        outbox.lease(1, Duration::from_secs(300), at(52)).await.unwrap();
        assert_eq!(outbox.recover(at(53)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn metrics_report_counts_and_age() {
        let outbox = Outbox::in_memory(policy_no_jitter(8)).await.unwrap();
        outbox.enqueue(intent("a"), TTL, at(0)).await.unwrap();
        outbox.enqueue(intent("b"), TTL, at(60)).await.unwrap();

        let metrics = outbox.metrics(at(120)).await.unwrap();
        assert_eq!(metrics.pending, 2);
        assert_eq!(metrics.oldest_pending_secs, Some(120));
    }
}
