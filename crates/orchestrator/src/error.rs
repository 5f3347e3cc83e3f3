//! Orchestration errors.

use thiserror::Error;

/// Config document rejection, reported at submit time and never reaching a
/// worker.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config is not an object")]
    NotAnObject,

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("unknown key `{key}` in {section} (strict validation)")]
    UnknownKey { section: String, key: String },

    #[error("unknown {category} type `{name}`; not a built-in and no plugin registered")]
    UnknownComponent { category: &'static str, name: String },

    #[error("plugin `{name}` failed to construct: {reason}")]
    Plugin { name: String, reason: String },

    #[error("{section}: {reason}")]
    Section { section: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("run store error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("run {0} not found")]
    UnknownRun(String),

    #[error("admission queue full: {queued} queued, cap {cap}")]
    ResourceExhausted { queued: usize, cap: usize },

    #[error("run {run_id} is {status}; operation not allowed")]
    InvalidState { run_id: String, status: String },

    #[error("worker launch failed: {0}")]
    Launch(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
