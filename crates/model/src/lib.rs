//! Shared data model for the backtest runtime.
//!
//! This crate defines the wire types every layer agrees on:
//!
//! - **Bar**: one OHLCV record for one symbol at one timestamp
//! - **Events**: the envelope and payloads that travel the engine bus and
//!   the run event stream (`MarketEvent`, `SignalEvent`, `OrderEvent`,
//!   `FillEvent`, `MetricsEvent`, plus risk and feed alerts)
//! - **Run**: the orchestrator's durable run record and its status machine
//!
//! Everything here is serde-serializable; prices and cash are
//! `rust_decimal::Decimal`, quantities are integer units.

mod bar;
mod events;
mod run;
mod types;

pub use bar::Bar;
pub use events::{
    Event, EventKind, EventRecord, FeedAlertEvent, FeedAlertKind, FillEvent, MarketEvent,
    MetricsEvent, OrderEvent, RiskAlertEvent, SignalEvent,
};
pub use run::{Run, RunStatus};
pub use types::{OrderSide, OrderType, Severity, SignalDirection, TimeInForce};
