//! Durable notification plane.
//!
//! Kernel events that match a notification rule become
//! [`NotificationIntent`]s via the stateless [`SignalBridge`]; intents are
//! persisted in the [`Outbox`] (the transactional-outbox pattern: the
//! durability boundary is the insert), and [`Dispatcher`] workers lease
//! batches, invoke a [`ChannelAdapter`], and record the outcome with
//! bounded-backoff retry and a dead-letter terminal state. Delivery is
//! at-least-once; intents live here until terminal regardless of how the
//! originating run ends.

mod bridge;
mod channel;
mod dispatcher;
mod error;
mod intent;
mod store;

pub use bridge::{BridgeConfig, ChannelTarget, SignalBridge};
pub use channel::{
    classify_http_status, render_message, ChannelAdapter, InMemoryAdapter, SendOutcome,
    WebhookAdapter,
};
pub use dispatcher::{run_lease_recovery, BatchStats, Dispatcher, DispatcherConfig};
pub use error::OutboxError;
pub use intent::{IntentStatus, IntentType, NewIntent, NotificationIntent};
pub use store::{EnqueueOutcome, Outbox, OutboxMetrics, RetryPolicy};
