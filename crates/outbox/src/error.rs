//! Delivery-plane errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("intent payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("unknown intent {0}")]
    UnknownIntent(String),

    #[error("invalid stored value: {0}")]
    Corrupt(String),
}
