//! Notification intents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use model::Severity;

/// What kind of notification an intent carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    StrategySignal,
    FillReport,
    RiskAlert,
    SystemAlert,
}

impl IntentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StrategySignal => "strategy_signal",
            Self::FillReport => "fill_report",
            Self::RiskAlert => "risk_alert",
            Self::SystemAlert => "system_alert",
        }
    }
}

impl std::str::FromStr for IntentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strategy_signal" => Ok(Self::StrategySignal),
            "fill_report" => Ok(Self::FillReport),
            "risk_alert" => Ok(Self::RiskAlert),
            "system_alert" => Ok(Self::SystemAlert),
            other => Err(format!("unknown intent type: {other}")),
        }
    }
}

/// Delivery status of an intent.
///
/// Transitions: `Pending -> Leased -> (Sent | Pending on release |
/// DeadLetter)`. Retryable failures return to `Pending` with a scheduled
/// `next_retry_at`; `Sent` and `DeadLetter` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    Leased,
    Sent,
    DeadLetter,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Sent => "sent",
            Self::DeadLetter => "dead_letter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::DeadLetter)
    }
}

impl std::str::FromStr for IntentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "sent" => Ok(Self::Sent),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(format!("unknown intent status: {other}")),
        }
    }
}

/// A not-yet-persisted intent, as produced by the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIntent {
    pub dedupe_key: String,
    pub intent_type: IntentType,
    pub severity: Severity,
    pub payload: serde_json::Value,
    /// Target channel reference (adapter name).
    pub channel: String,
}

/// A persisted intent, as leased by dispatchers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationIntent {
    pub id: String,
    pub dedupe_key: String,
    pub intent_type: IntentType,
    pub severity: Severity,
    pub payload: serde_json::Value,
    pub channel: String,
    pub status: IntentStatus,
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub leased_until: Option<DateTime<Utc>>,
}
