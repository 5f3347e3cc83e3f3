//! Channel adapter contract and the built-in transports.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::json;
use tracing::debug;

use crate::intent::{IntentType, NotificationIntent};

/// Result of one delivery attempt.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Ok,
    /// Transient failure (network, rate limit, 5xx). `retry_after` carries
    /// a server-indicated back-off window when one was given.
    Retryable {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// The channel will never accept this intent (validation failure,
    /// unknown recipient). Dead-letters immediately.
    Permanent { reason: String },
}

/// Pluggable transport to an external channel.
///
/// Adapters render the intent through a per-type template and speak the
/// channel's own authentication and rate-limit protocol. Delivery must be
/// safe to retry: the dispatcher guarantees at-least-once, not
/// exactly-once.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Name the dispatcher routes `intent.channel` on.
    fn name(&self) -> &str;

    async fn send(&self, intent: &NotificationIntent) -> SendOutcome;
}

/// Render the human-readable line for an intent.
pub fn render_message(intent: &NotificationIntent) -> String {
    let payload = &intent.payload;
    let field = |name: &str| payload.get(name).and_then(|v| v.as_str()).unwrap_or("?");
    match intent.intent_type {
        IntentType::StrategySignal => format!(
            "SIGNAL {} {} strength={} strategy={}",
            field("symbol"),
            field("direction"),
            payload.get("strength").map(ToString::to_string).unwrap_or_else(|| "?".into()),
            field("strategy_id"),
        ),
        IntentType::FillReport => format!(
            "FILL {} {} {}@{}",
            field("symbol"),
            field("side"),
            payload.get("quantity").map(ToString::to_string).unwrap_or_else(|| "?".into()),
            field("fill_price"),
        ),
        IntentType::RiskAlert => format!(
            "RISK {} {}: {}",
            field("rule"),
            field("symbol"),
            field("reason"),
        ),
        IntentType::SystemAlert => format!("ALERT {}", field("detail")),
    }
}

/// Generic JSON webhook transport.
pub struct WebhookAdapter {
    name: String,
    client: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
}

impl WebhookAdapter {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.into(),
            client,
            url: url.into(),
            bearer_token,
        })
    }

}

/// Map an HTTP response status onto a send outcome: 2xx ok, 429/5xx
/// retryable (honoring `Retry-After`), other 4xx permanent.
pub fn classify_http_status(status: StatusCode, retry_after: Option<Duration>) -> SendOutcome {
    if status.is_success() {
        SendOutcome::Ok
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SendOutcome::Retryable {
            reason: format!("http {status}"),
            retry_after,
        }
    } else {
        SendOutcome::Permanent {
            reason: format!("http {status}"),
        }
    }
}

#[async_trait]
impl ChannelAdapter for WebhookAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, intent: &NotificationIntent) -> SendOutcome {
        let body = json!({
            "intent_id": intent.id,
            "intent_type": intent.intent_type.as_str(),
            "severity": intent.severity.as_str(),
            "message": render_message(intent),
            "payload": intent.payload,
        });
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .map(Duration::from_secs);
                debug!(channel = %self.name, status = %response.status(), "webhook delivery");
                classify_http_status(response.status(), retry_after)
            }
            // Timeouts and connection errors are always worth retrying.
            Err(err) => SendOutcome::Retryable {
                reason: format!("request failed: {err}"),
                retry_after: None,
            },
        }
    }
}

/// Test adapter: records every send and replays scripted outcomes.
#[derive(Default)]
pub struct InMemoryAdapter {
    name: String,
    sent: Mutex<Vec<NotificationIntent>>,
    script: Mutex<Vec<SendOutcome>>,
}

impl InMemoryAdapter {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            sent: Mutex::new(Vec::new()),
            script: Mutex::new(Vec::new()),
        })
    }

    /// Queue an outcome for a future send; when the script is empty every
    /// send succeeds.
    pub fn push_outcome(&self, outcome: SendOutcome) {
        self.script.lock().push(outcome);
    }

    pub fn sent(&self) -> Vec<NotificationIntent> {
        self.sent.lock().clone()
    }

    pub fn delivery_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl ChannelAdapter for InMemoryAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, intent: &NotificationIntent) -> SendOutcome {
        let outcome = {
            let mut script = self.script.lock();
            if script.is_empty() {
                SendOutcome::Ok
            } else {
                script.remove(0)
            }
        };
        if matches!(outcome, SendOutcome::Ok) {
            self.sent.lock().push(intent.clone());
        }
        outcome
    }
}
