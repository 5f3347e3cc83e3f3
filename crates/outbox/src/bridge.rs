//! Stateless mapping from kernel events to notification intents.

use std::time::Duration;

use serde_json::json;

use model::{Event, EventRecord, FeedAlertKind, Severity};

use crate::intent::{IntentType, NewIntent};

/// One configured delivery target.
#[derive(Debug, Clone)]
pub struct ChannelTarget {
    /// Adapter name the dispatcher routes on.
    pub name: String,
    /// Quietest severity this channel wants to hear about.
    pub min_severity: Severity,
}

/// Bridge rules.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Signals below this severity are dropped before dedupe.
    pub min_severity: Severity,
    /// Window within which intents sharing a dedupe key collapse.
    pub dedupe_ttl: Duration,
    pub channels: Vec<ChannelTarget>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            min_severity: Severity::Info,
            dedupe_ttl: Duration::from_secs(300),
            channels: Vec::new(),
        }
    }
}

/// Pure function of (event, config) -> intents. One intent per matching
/// channel; the channel name participates in the dedupe key so channels
/// dedupe independently.
#[derive(Debug, Clone)]
pub struct SignalBridge {
    config: BridgeConfig,
}

impl SignalBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    pub fn dedupe_ttl(&self) -> Duration {
        self.config.dedupe_ttl
    }

    /// Map one kernel event to its intents (empty for event kinds that do
    /// not notify, or when every channel filters the severity out).
    pub fn intents_for(&self, record: &EventRecord) -> Vec<NewIntent> {
        let Some((intent_type, severity, base_key, payload)) = self.classify(record) else {
            return Vec::new();
        };
        if severity < self.config.min_severity {
            return Vec::new();
        }
        self.config
            .channels
            .iter()
            .filter(|channel| severity >= channel.min_severity)
            .map(|channel| NewIntent {
                dedupe_key: format!("{base_key}:{}", channel.name),
                intent_type,
                severity,
                payload: payload.clone(),
                channel: channel.name.clone(),
            })
            .collect()
    }

    fn classify(
        &self,
        record: &EventRecord,
    ) -> Option<(IntentType, Severity, String, serde_json::Value)> {
        match &record.payload {
            Event::Signal(signal) => {
                // Bucketed on occurred-at: duplicate signals within one TTL
                // window share a key.
                let bucket = record.occurred_at.timestamp()
                    / self.config.dedupe_ttl.as_secs().max(1) as i64;
                let key = format!(
                    "{}:{}:{}:{}:{}",
                    record.run_id,
                    signal.strategy_id,
                    signal.symbol,
                    bucket,
                    signal.direction.as_str()
                );
                let payload = json!({
                    "run_id": record.run_id,
                    "strategy_id": signal.strategy_id,
                    "symbol": signal.symbol,
                    "direction": signal.direction.as_str(),
                    "strength": signal.strength,
                    "reason": signal.reason,
                    "occurred_at": record.occurred_at.to_rfc3339(),
                });
                Some((IntentType::StrategySignal, Severity::Info, key, payload))
            }
            Event::Fill(fill) => {
                let key = format!("{}:fill:{}", record.run_id, record.seq);
                let payload = json!({
                    "run_id": record.run_id,
                    "order_id": fill.order_id,
                    "symbol": fill.symbol,
                    "side": fill.side.as_str(),
                    "quantity": fill.quantity,
                    "fill_price": fill.fill_price,
                    "commission": fill.commission,
                    "remaining": fill.remaining,
                    "occurred_at": record.occurred_at.to_rfc3339(),
                });
                Some((IntentType::FillReport, Severity::Info, key, payload))
            }
            Event::RiskAlert(alert) => {
                let key = format!("{}:risk:{}", record.run_id, record.seq);
                let payload = json!({
                    "run_id": record.run_id,
                    "rule": alert.rule,
                    "symbol": alert.symbol,
                    "reason": alert.reason,
                    "occurred_at": record.occurred_at.to_rfc3339(),
                });
                Some((IntentType::RiskAlert, alert.severity, key, payload))
            }
            Event::FeedAlert(alert) => {
                let severity = match alert.alert {
                    FeedAlertKind::Reconnected { .. } => Severity::Info,
                    FeedAlertKind::HeartbeatTimeout | FeedAlertKind::Gap { .. } => {
                        Severity::Warning
                    }
                };
                let key = format!("{}:feed:{}", record.run_id, record.seq);
                let payload = json!({
                    "run_id": record.run_id,
                    "alert": alert.alert,
                    "symbol": alert.symbol,
                    "detail": alert.detail,
                    "occurred_at": record.occurred_at.to_rfc3339(),
                });
                Some((IntentType::SystemAlert, severity, key, payload))
            }
            Event::Market(_) | Event::Order(_) | Event::Metrics(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use model::{EventKind, SignalDirection, SignalEvent};

    fn signal_record(minute: u32) -> EventRecord {
        EventRecord {
            seq: minute as u64,
            kind: EventKind::Signal,
            occurred_at: Utc.with_ymd_and_hms(2024, 1, 2, 9, minute, 0).unwrap(),
            run_id: "run-1".into(),
            symbol_seq: Some(1),
            trace_id: "t-1".into(),
            payload: Event::Signal(SignalEvent {
                strategy_id: "ma".into(),
                symbol: "SPY".into(),
                direction: SignalDirection::Long,
                strength: 0.8,
                reason: "cross".into(),
                target_weight: None,
            }),
        }
    }

    fn bridge(channels: Vec<ChannelTarget>) -> SignalBridge {
        SignalBridge::new(BridgeConfig {
            min_severity: Severity::Info,
            dedupe_ttl: Duration::from_secs(300),
            channels,
        })
    }

    #[test]
    fn signal_maps_to_one_intent_per_channel() {
        let bridge = bridge(vec![
            ChannelTarget {
                name: "chat".into(),
                min_severity: Severity::Info,
            },
            ChannelTarget {
                name: "pager".into(),
                min_severity: Severity::Critical,
            },
        ]);
        let intents = bridge.intents_for(&signal_record(0));
        // Info-level signal reaches chat but not the critical-only pager.
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].channel, "chat");
        assert_eq!(intents[0].intent_type, IntentType::StrategySignal);
    }

    #[test]
    fn dedupe_key_buckets_on_occurred_at() {
        let bridge = bridge(vec![ChannelTarget {
            name: "chat".into(),
            min_severity: Severity::Info,
        }]);
        // Two signals 2 minutes apart share a 5-minute bucket.
        let a = bridge.intents_for(&signal_record(0));
        let b = bridge.intents_for(&signal_record(2));
        assert_eq!(a[0].dedupe_key, b[0].dedupe_key);
        // A signal in the next bucket gets a fresh key.
        let c = bridge.intents_for(&signal_record(6));
        assert_ne!(a[0].dedupe_key, c[0].dedupe_key);
    }

    #[test]
    fn market_events_produce_nothing() {
        let bridge = bridge(vec![ChannelTarget {
            name: "chat".into(),
            min_severity: Severity::Info,
        }]);
        let mut record = signal_record(0);
        record.kind = EventKind::Metrics;
        record.payload = Event::Metrics(model::MetricsEvent {
            equity: Default::default(),
            cash: Default::default(),
            realized_pnl: Default::default(),
            unrealized_pnl: Default::default(),
            holdings: Default::default(),
        });
        assert!(bridge.intents_for(&record).is_empty());
    }
}
