//! Dispatcher workers: lease, send, record.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::{ChannelAdapter, SendOutcome};
use crate::error::OutboxError;
use crate::store::Outbox;

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub batch_size: u32,
    pub lease_duration: Duration,
    /// Idle sleep between polls of the outbox.
    pub poll_interval: Duration,
    /// Per-send timeout; a timeout classifies as retryable.
    pub send_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            lease_duration: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            send_timeout: Duration::from_secs(10),
        }
    }
}

/// Counters from one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub leased: usize,
    pub sent: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

/// One dispatcher worker.
///
/// Several dispatchers may run against the same outbox; the atomic lease
/// makes double delivery impossible, though the channel may still see
/// intents out of order - only at-least-once delivery of each intent is
/// guaranteed.
pub struct Dispatcher {
    outbox: Outbox,
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
    fallback: Option<Arc<dyn ChannelAdapter>>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(outbox: Outbox, config: DispatcherConfig) -> Self {
        Self {
            outbox,
            adapters: HashMap::new(),
            fallback: None,
            config,
        }
    }

    /// Register a transport under its routing name.
    pub fn with_adapter(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.insert(adapter.name().to_string(), adapter);
        self
    }

    /// Transport used when no named adapter matches an intent's channel.
    /// Useful when channel names come from run configuration and are not
    /// known at startup.
    pub fn with_fallback_adapter(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.fallback = Some(adapter);
        self
    }

    /// Lease one batch and attempt delivery of every intent in it.
    pub async fn process_batch(&self) -> Result<BatchStats, OutboxError> {
        let now = Utc::now();
        let batch = self
            .outbox
            .lease(self.config.batch_size, self.config.lease_duration, now)
            .await?;
        let mut stats = BatchStats {
            leased: batch.len(),
            ..BatchStats::default()
        };

        for intent in batch {
            let adapter = self
                .adapters
                .get(&intent.channel)
                .or(self.fallback.as_ref());
            let outcome = match adapter {
                Some(adapter) => {
                    match tokio::time::timeout(self.config.send_timeout, adapter.send(&intent))
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => SendOutcome::Retryable {
                            reason: format!("send timed out after {:?}", self.config.send_timeout),
                            retry_after: None,
                        },
                    }
                }
                None => SendOutcome::Permanent {
                    reason: format!("no adapter registered for channel {}", intent.channel),
                },
            };

            match &outcome {
                SendOutcome::Ok => stats.sent += 1,
                SendOutcome::Retryable { reason, .. } => {
                    stats.retried += 1;
                    debug!(intent = %intent.id, channel = %intent.channel, %reason, "delivery will retry");
                }
                SendOutcome::Permanent { reason } => {
                    stats.dead_lettered += 1;
                    warn!(intent = %intent.id, channel = %intent.channel, %reason, "delivery failed permanently");
                }
            }
            self.outbox
                .record_outcome(&intent.id, &outcome, Utc::now())
                .await?;
        }
        Ok(stats)
    }

    /// Worker loop: poll until shutdown. Run one or more of these as tokio
    /// tasks.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.config.batch_size,
            adapters = self.adapters.len(),
            "dispatcher started"
        );
        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.process_batch().await {
                        Ok(stats) if stats.leased > 0 => {
                            debug!(?stats, "batch processed");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "dispatcher batch failed"),
                    }
                }
            }
        }
        info!("dispatcher stopped");
    }
}

/// Periodically release expired leases so a crashed dispatcher can never
/// strand intents. Also run once at startup.
pub async fn run_lease_recovery(
    outbox: Outbox,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if let Err(err) = outbox.recover(Utc::now()).await {
            warn!(error = %err, "lease recovery failed");
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryAdapter;
    use crate::intent::{IntentStatus, IntentType, NewIntent};
    use crate::store::RetryPolicy;
    use model::Severity;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(300);

    fn intent(key: &str) -> NewIntent {
        NewIntent {
            dedupe_key: key.to_string(),
            intent_type: IntentType::FillReport,
            severity: Severity::Info,
            payload: json!({"symbol": "SPY"}),
            channel: "chat".to_string(),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(0),
            max_delay: Duration::from_millis(0),
            jitter: 0.0,
        }
    }

    async fn drain(dispatcher: &Dispatcher) {
        // Process until the queue stops yielding leases.
        loop {
            let stats = dispatcher.process_batch().await.unwrap();
            if stats.leased == 0 {
                break;
            }
        }
    }

    #[tokio::test]
    async fn delivers_and_marks_sent() {
        let outbox = Outbox::in_memory(fast_policy()).await.unwrap();
        let adapter = InMemoryAdapter::new("chat");
        let dispatcher =
            Dispatcher::new(outbox.clone(), DispatcherConfig::default()).with_adapter(adapter.clone());

        let id = outbox
            .enqueue(intent("k"), TTL, Utc::now())
            .await
            .unwrap()
            .id()
            .to_string();
        drain(&dispatcher).await;

        assert_eq!(adapter.delivery_count(), 1);
        assert_eq!(
            outbox.get(&id).await.unwrap().unwrap().status,
            IntentStatus::Sent
        );
    }

    #[tokio::test]
    async fn dedupe_invokes_adapter_at_most_once() {
        // Ten identical intents within one TTL window: one persisted, one
        // delivered.
        let outbox = Outbox::in_memory(fast_policy()).await.unwrap();
        let adapter = InMemoryAdapter::new("chat");
        let dispatcher =
            Dispatcher::new(outbox.clone(), DispatcherConfig::default()).with_adapter(adapter.clone());

        let now = Utc::now();
        for _ in 0..10 {
            outbox.enqueue(intent("same"), TTL, now).await.unwrap();
        }
        drain(&dispatcher).await;

        assert_eq!(adapter.delivery_count(), 1);
        let metrics = outbox.metrics(Utc::now()).await.unwrap();
        assert_eq!(metrics.total(), 1);
        assert_eq!(metrics.sent, 1);
    }

    #[tokio::test]
    async fn crash_and_recovery_end_in_terminal_states() {
        // Scenario: enqueue 100, a dispatcher leases a batch and crashes,
        // a second dispatcher finishes after lease recovery. Every intent
        // ends sent or dead-lettered; none is delivered twice.
        let outbox = Outbox::in_memory(fast_policy()).await.unwrap();
        let now = Utc::now();
        for index in 0..100 {
            outbox
                .enqueue(intent(&format!("k{index}")), TTL, now)
                .await
                .unwrap();
        }

        // The crashing dispatcher: leases 30 with a tiny lease, never acks.
        let crashed = outbox
            .lease(30, Duration::from_millis(1), now)
            .await
            .unwrap();
        assert_eq!(crashed.len(), 30);

        // Recovery releases the expired leases; nothing is lost.
        tokio::time::sleep(Duration::from_millis(5)).await;
        outbox.recover(Utc::now()).await.unwrap();

        let adapter = InMemoryAdapter::new("chat");
        // One delivery fails permanently along the way.
        adapter.push_outcome(SendOutcome::Permanent {
            reason: "unknown recipient".into(),
        });
        let dispatcher =
            Dispatcher::new(outbox.clone(), DispatcherConfig::default()).with_adapter(adapter.clone());
        drain(&dispatcher).await;

        let metrics = outbox.metrics(Utc::now()).await.unwrap();
        assert_eq!(metrics.total(), 100);
        assert_eq!(metrics.pending, 0);
        assert_eq!(metrics.leased, 0);
        assert_eq!(metrics.sent, 99);
        assert_eq!(metrics.dead_letter, 1);
        // No duplicate delivery for any intent id.
        let mut ids: Vec<String> = adapter.sent().iter().map(|i| i.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 99);
    }

    #[tokio::test]
    async fn retryable_failures_eventually_send() {
        let outbox = Outbox::in_memory(fast_policy()).await.unwrap();
        let adapter = InMemoryAdapter::new("chat");
        adapter.push_outcome(SendOutcome::Retryable {
            reason: "http 503".into(),
            retry_after: None,
        });
        let dispatcher =
            Dispatcher::new(outbox.clone(), DispatcherConfig::default()).with_adapter(adapter.clone());

        let id = outbox
            .enqueue(intent("k"), TTL, Utc::now())
            .await
            .unwrap()
            .id()
            .to_string();

        // First pass fails, zero-delay policy makes it due immediately,
        // second pass succeeds.
        drain(&dispatcher).await;
        let stored = outbox.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, IntentStatus::Sent);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(adapter.delivery_count(), 1);
    }

    #[tokio::test]
    async fn unknown_channel_dead_letters() {
        let outbox = Outbox::in_memory(fast_policy()).await.unwrap();
        let dispatcher = Dispatcher::new(outbox.clone(), DispatcherConfig::default());

        let id = outbox
            .enqueue(intent("k"), TTL, Utc::now())
            .await
            .unwrap()
            .id()
            .to_string();
        drain(&dispatcher).await;

        assert_eq!(
            outbox.get(&id).await.unwrap().unwrap().status,
            IntentStatus::DeadLetter
        );
    }
}
