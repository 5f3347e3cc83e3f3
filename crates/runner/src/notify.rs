//! Wiring between the run relay and the notification plane.
//!
//! [`NotifySink`] watches relayed events, resolves the owning run's
//! notification rules, and enqueues intents. [`ConfigWebhookAdapter`] is
//! the dispatcher's fallback transport: it resolves the destination and
//! credentials from the run's channel configuration at send time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, warn};

use model::EventRecord;
use orchestrator::{EventSink, RunConfig, RunStore, ValidationMode};
use outbox::{
    classify_http_status, render_message, BridgeConfig, ChannelAdapter, ChannelTarget,
    NotificationIntent, Outbox, SendOutcome, SignalBridge,
};

fn channel_name(channel: &orchestrator::config::ChannelConfig) -> String {
    channel
        .name
        .clone()
        .unwrap_or_else(|| channel.r#type.clone())
}

/// Bridges kernel events into the outbox, per the owning run's
/// notification configuration.
pub struct NotifySink {
    store: RunStore,
    outbox: Outbox,
    /// Per-run bridge cache; `None` marks runs with notifications off.
    bridges: Mutex<HashMap<String, Option<Arc<SignalBridge>>>>,
}

impl NotifySink {
    pub fn new(store: RunStore, outbox: Outbox) -> Self {
        Self {
            store,
            outbox,
            bridges: Mutex::new(HashMap::new()),
        }
    }

    async fn bridge_for(&self, run_id: &str) -> Option<Arc<SignalBridge>> {
        if let Some(cached) = self.bridges.lock().get(run_id) {
            return cached.clone();
        }

        let run = self.store.get(run_id).await.ok().flatten()?;
        let config = RunConfig::parse(&run.config, ValidationMode::Forward).ok()?;
        let bridge = config
            .notifications
            .filter(|section| section.enabled && !section.channels.is_empty())
            .map(|section| {
                Arc::new(SignalBridge::new(BridgeConfig {
                    min_severity: section.min_level,
                    dedupe_ttl: Duration::from_secs(section.dedupe_ttl_seconds),
                    channels: section
                        .channels
                        .iter()
                        .map(|channel| ChannelTarget {
                            name: channel_name(channel),
                            min_severity: channel.min_severity,
                        })
                        .collect(),
                }))
            });

        self.bridges
            .lock()
            .insert(run_id.to_string(), bridge.clone());
        bridge
    }
}

#[async_trait]
impl EventSink for NotifySink {
    async fn on_event(&self, record: &EventRecord) {
        let Some(bridge) = self.bridge_for(&record.run_id).await else {
            return;
        };
        let now = Utc::now();
        for intent in bridge.intents_for(record) {
            if let Err(err) = self
                .outbox
                .enqueue(intent, bridge.dedupe_ttl(), now)
                .await
            {
                warn!(run_id = %record.run_id, error = %err, "intent enqueue failed");
            }
        }
    }
}

/// Fallback webhook transport resolving destination and credentials from
/// the run's channel configuration at send time.
pub struct ConfigWebhookAdapter {
    store: RunStore,
    client: reqwest::Client,
}

impl ConfigWebhookAdapter {
    pub fn new(store: RunStore, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            store,
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl ChannelAdapter for ConfigWebhookAdapter {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, intent: &NotificationIntent) -> SendOutcome {
        let Some(run_id) = intent.payload.get("run_id").and_then(|v| v.as_str()) else {
            return SendOutcome::Permanent {
                reason: "intent payload has no run_id".to_string(),
            };
        };
        let run = match self.store.get(run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                return SendOutcome::Permanent {
                    reason: format!("run {run_id} no longer exists"),
                }
            }
            Err(err) => {
                return SendOutcome::Retryable {
                    reason: format!("run lookup failed: {err}"),
                    retry_after: None,
                }
            }
        };
        let Ok(config) = RunConfig::parse(&run.config, ValidationMode::Forward) else {
            return SendOutcome::Permanent {
                reason: "run config no longer parseable".to_string(),
            };
        };
        let Some(channel) = config
            .notifications
            .as_ref()
            .and_then(|section| {
                section
                    .channels
                    .iter()
                    .find(|channel| channel_name(channel) == intent.channel)
            })
        else {
            return SendOutcome::Permanent {
                reason: format!("channel {} not configured for run {run_id}", intent.channel),
            };
        };

        let body = json!({
            "intent_id": intent.id,
            "intent_type": intent.intent_type.as_str(),
            "severity": intent.severity.as_str(),
            "message": render_message(intent),
            "payload": intent.payload,
        });
        let mut request = self.client.post(&channel.destination).json(&body);
        if let Some(reference) = &channel.credentials_reference {
            match std::env::var(reference) {
                Ok(token) => request = request.bearer_auth(token),
                Err(_) => {
                    return SendOutcome::Permanent {
                        reason: format!("credentials reference {reference} is not set"),
                    }
                }
            }
        }

        match request.send().await {
            Ok(response) => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .map(Duration::from_secs);
                debug!(
                    channel = %intent.channel,
                    status = %response.status(),
                    "webhook delivery"
                );
                classify_http_status(response.status(), retry_after)
            }
            Err(err) => SendOutcome::Retryable {
                reason: format!("request failed: {err}"),
                retry_after: None,
            },
        }
    }
}
