//! Double moving-average crossover.

use model::{Bar, SignalDirection, SignalEvent};

use crate::error::StrategyError;
use crate::strategies::indicators::Sma;
use crate::traits::Strategy;

/// Emits a long signal when the short SMA crosses above the long SMA and an
/// exit (or short, when enabled) when it crosses back below.
///
/// State is per-symbol trivially: the strategy is bound to one symbol and
/// ignores bars for any other.
pub struct MovingAverageStrategy {
    id: String,
    symbol: String,
    short: Sma,
    long: Sma,
    allow_short: bool,
    /// -1 short-regime, +1 long-regime; None until both windows are warm.
    last_state: Option<i8>,
}

impl MovingAverageStrategy {
    pub fn new(
        id: impl Into<String>,
        symbol: impl Into<String>,
        short_window: usize,
        long_window: usize,
        allow_short: bool,
    ) -> Result<Self, StrategyError> {
        if short_window == 0 || long_window == 0 || short_window >= long_window {
            return Err(StrategyError::InvalidConfig(format!(
                "short window ({short_window}) must be positive and smaller than long window ({long_window})"
            )));
        }
        Ok(Self {
            id: id.into(),
            symbol: symbol.into(),
            short: Sma::new(short_window),
            long: Sma::new(long_window),
            allow_short,
            last_state: None,
        })
    }
}

impl Strategy for MovingAverageStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn on_bar(&mut self, bar: &Bar, signals: &mut Vec<SignalEvent>) -> Result<(), StrategyError> {
        if bar.symbol != self.symbol {
            return Ok(());
        }
        let short = self.short.update(bar.close);
        let long = self.long.update(bar.close);
        let (Some(short), Some(long)) = (short, long) else {
            return Ok(());
        };

        let state: i8 = if short > long { 1 } else { -1 };
        if self.last_state == Some(state) {
            return Ok(());
        }
        let crossed_before = self.last_state.is_some();
        self.last_state = Some(state);

        let direction = if state > 0 {
            SignalDirection::Long
        } else if self.allow_short {
            SignalDirection::Short
        } else if crossed_before {
            SignalDirection::Exit
        } else {
            // Short regime on warm-up with shorting disabled: nothing to do.
            return Ok(());
        };

        signals.push(SignalEvent {
            strategy_id: self.id.clone(),
            symbol: self.symbol.clone(),
            direction,
            strength: 1.0,
            reason: format!("sma({short:.4}) vs sma({long:.4})"),
            target_weight: None,
        });
        Ok(())
    }
}
