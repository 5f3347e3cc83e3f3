//! Kernel error types.

use thiserror::Error;

/// Errors surfaced by the engine to its caller.
///
/// Only two terminal outcomes exist for a run: the feed is exhausted
/// (success) or one of these is returned.
#[derive(Debug, Error)]
pub enum EngineError {
    /// `drain` was called from inside a dispatch.
    #[error("event bus re-entrancy: drain called while dispatching")]
    BusReentrancy,

    /// Subscription attempted while a dispatch was active.
    #[error("cannot subscribe while the bus is dispatching")]
    SubscribeWhileDispatching,

    /// The data feed failed fatally.
    #[error("feed error: {0}")]
    Feed(#[from] FeedError),

    /// A strategy failed too many times in a row.
    #[error("strategy {strategy_id} exceeded its strike budget after {strikes} consecutive errors")]
    StrikeBudgetExceeded { strategy_id: String, strikes: u32 },

    /// A pipeline stage failed in a way that invalidates the run.
    #[error("fatal stage error: {0}")]
    Stage(String),
}

/// Errors produced by data feeds.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed feed data: {0}")]
    Parse(String),

    /// A live feed gave up reconnecting.
    #[error("feed disconnected: {0}")]
    Disconnected(String),
}

/// Errors raised by user strategies.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("market data not available for {0}")]
    NoMarketData(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors raised by reporters writing to their sinks.
#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("reporter I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("reporter serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome of a subscriber handling one event.
///
/// Recoverable failures are logged and the event is skipped for that
/// subscriber; fatal failures abort the drain and end the run.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{0}")]
    Recoverable(String),

    #[error(transparent)]
    Fatal(EngineError),
}
