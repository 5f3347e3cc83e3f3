//! Bus events and the envelope they travel in.
//!
//! Every message on the engine bus is an [`EventRecord`]: a payload plus the
//! envelope fields the runtime needs for ordering, replay, and streaming
//! (sequence number assigned on publish, occurred-at, run id, per-symbol
//! sequence, trace id).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bar::Bar;
use crate::types::{OrderSide, OrderType, Severity, SignalDirection, TimeInForce};

/// Kind tag used for subscription routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Market,
    Signal,
    Order,
    Fill,
    Metrics,
    RiskAlert,
    FeedAlert,
}

/// New market data for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketEvent {
    pub bar: Bar,
}

/// Strategy signal indicating a desired exposure change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub strategy_id: String,
    pub symbol: String,
    pub direction: SignalDirection,
    /// Conviction in `[0, 1]`.
    pub strength: f64,
    pub reason: String,
    /// Target fractional exposure for weight-based sizing.
    pub target_weight: Option<Decimal>,
}

/// Portfolio instruction for the execution handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    /// Engine-scoped order id, stable across the order's lifetime.
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    /// Requested quantity in integer units, always positive.
    pub quantity: i64,
    pub order_type: OrderType,
    /// Limit or stop reference price; `None` for market orders.
    pub price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    /// Trace id of the signal that produced this order.
    pub signal_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Execution report published by the execution handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    /// Quantity filled by this event, always positive.
    pub quantity: i64,
    pub fill_price: Decimal,
    pub commission: Decimal,
    /// Price adjustment applied against the trade side.
    pub slippage: Decimal,
    /// Quantity still open on the order after this fill.
    pub remaining: i64,
    pub timestamp: DateTime<Utc>,
}

impl FillEvent {
    /// Signed quantity (+ for buys, - for sells).
    pub fn signed_quantity(&self) -> i64 {
        self.side.sign() * self.quantity
    }
}

/// Snapshot of portfolio state after a fill or at run end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEvent {
    pub equity: Decimal,
    pub cash: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    /// Net units held per symbol. BTreeMap keeps serialization stable.
    pub holdings: BTreeMap<String, i64>,
}

/// A rejected order or strategy failure surfaced for notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAlertEvent {
    /// Name of the rule or stage that rejected (e.g. "max_position").
    pub rule: String,
    pub symbol: String,
    pub reason: String,
    pub severity: Severity,
    pub order_id: Option<String>,
}

/// What went wrong (or quiet) on a live feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FeedAlertKind {
    /// No bar arrived within the configured heartbeat interval.
    HeartbeatTimeout,
    /// Per-symbol sequence jumped; bars were likely lost upstream.
    Gap { expected: u64, got: u64 },
    /// Feed reconnected after transient failures.
    Reconnected { attempts: u32 },
}

/// Feed health event published by live data feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedAlertEvent {
    pub alert: FeedAlertKind,
    pub symbol: Option<String>,
    pub detail: String,
}

/// Payload union for everything that can travel the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "data")]
pub enum Event {
    Market(MarketEvent),
    Signal(SignalEvent),
    Order(OrderEvent),
    Fill(FillEvent),
    Metrics(MetricsEvent),
    RiskAlert(RiskAlertEvent),
    FeedAlert(FeedAlertEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Market(_) => EventKind::Market,
            Event::Signal(_) => EventKind::Signal,
            Event::Order(_) => EventKind::Order,
            Event::Fill(_) => EventKind::Fill,
            Event::Metrics(_) => EventKind::Metrics,
            Event::RiskAlert(_) => EventKind::RiskAlert,
            Event::FeedAlert(_) => EventKind::FeedAlert,
        }
    }

    /// Symbol the event concerns, when it has one.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Event::Market(e) => Some(&e.bar.symbol),
            Event::Signal(e) => Some(&e.symbol),
            Event::Order(e) => Some(&e.symbol),
            Event::Fill(e) => Some(&e.symbol),
            Event::Metrics(_) => None,
            Event::RiskAlert(e) => Some(&e.symbol),
            Event::FeedAlert(e) => e.symbol.as_deref(),
        }
    }
}

/// The envelope every in-bus message carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Monotonically increasing sequence assigned on publish.
    pub seq: u64,
    pub kind: EventKind,
    /// Virtual time of the event (bar time in backtests).
    pub occurred_at: DateTime<Utc>,
    pub run_id: String,
    /// Position of the event within its symbol's stream, where applicable.
    pub symbol_seq: Option<u64>,
    /// Identifier linking an event to the market event that caused it.
    pub trace_id: String,
    pub payload: Event,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn bar() -> Bar {
        Bar {
            symbol: "SPY".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            open: dec!(100),
            high: dec!(101),
            low: dec!(99),
            close: dec!(100.5),
            volume: dec!(1000),
            amount: dec!(100_500),
        }
    }

    #[test]
    fn kind_matches_payload() {
        let event = Event::Market(MarketEvent { bar: bar() });
        assert_eq!(event.kind(), EventKind::Market);
        assert_eq!(event.symbol(), Some("SPY"));
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let record = EventRecord {
            seq: 7,
            kind: EventKind::Fill,
            occurred_at: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            run_id: "run-1".into(),
            symbol_seq: Some(3),
            trace_id: "t-3".into(),
            payload: Event::Fill(FillEvent {
                order_id: "ord-1".into(),
                symbol: "SPY".into(),
                side: OrderSide::Buy,
                quantity: 100,
                fill_price: dec!(100.5),
                commission: dec!(1),
                slippage: dec!(0),
                remaining: 0,
                timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            }),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: EventRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
