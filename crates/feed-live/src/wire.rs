//! Wire format for live ticks.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use model::Bar;

/// One tick as received from a live source.
///
/// Sources that only publish a price produce degenerate bars where
/// open = high = low = close; sources that publish a sequence number get
/// per-symbol gap detection for free.
#[derive(Debug, Clone, Deserialize)]
pub struct WireTick {
    #[serde(default)]
    pub symbol: Option<String>,
    pub price: Decimal,
    #[serde(default)]
    pub volume: Decimal,
    /// Per-symbol sequence number assigned by the source.
    #[serde(default)]
    pub seq: Option<u64>,
    /// Event time in unix milliseconds; defaults to receive time.
    #[serde(default)]
    pub ts: Option<i64>,
}

impl WireTick {
    /// Convert to a bar, filling in the fallback symbol and receive time.
    pub fn into_bar(self, fallback_symbol: &str, received_at: DateTime<Utc>) -> Bar {
        let timestamp = self
            .ts
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .unwrap_or(received_at);
        Bar {
            symbol: self.symbol.unwrap_or_else(|| fallback_symbol.to_string()),
            timestamp,
            open: self.price,
            high: self.price,
            low: self.price,
            close: self.price,
            volume: self.volume,
            amount: self.price * self.volume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_minimal_tick() {
        let tick: WireTick = serde_json::from_str(r#"{"price": "101.5"}"#).unwrap();
        let now = Utc::now();
        let bar = tick.into_bar("SPY", now);
        assert_eq!(bar.symbol, "SPY");
        assert_eq!(bar.close, dec!(101.5));
        assert_eq!(bar.timestamp, now);
    }

    #[test]
    fn parses_full_tick() {
        let tick: WireTick = serde_json::from_str(
            r#"{"symbol": "QQQ", "price": 42, "volume": 10, "seq": 7, "ts": 1704153600000}"#,
        )
        .unwrap();
        assert_eq!(tick.seq, Some(7));
        let bar = tick.clone().into_bar("SPY", Utc::now());
        assert_eq!(bar.symbol, "QQQ");
        assert_eq!(bar.amount, dec!(420));
        assert_eq!(bar.timestamp.timestamp_millis(), 1_704_153_600_000);
    }
}
