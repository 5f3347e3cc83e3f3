//! OHLCV bar.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One OHLCV record for one symbol at one timestamp.
///
/// Bars are immutable once constructed; timestamps are monotonic within a
/// feed per symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Instrument symbol (e.g. "SPY").
    pub symbol: String,
    /// Bar close timestamp.
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Traded volume in units.
    pub volume: Decimal,
    /// Traded turnover in quote currency.
    #[serde(default)]
    pub amount: Decimal,
}

impl Bar {
    /// True when `price` lies inside the bar's traded range.
    pub fn touches(&self, price: Decimal) -> bool {
        price >= self.low && price <= self.high
    }
}
