//! Channel breakout on prior N-bar extremes.

use model::{Bar, SignalDirection, SignalEvent};

use crate::error::StrategyError;
use crate::strategies::indicators::{RollingHigh, RollingLow};
use crate::traits::Strategy;

/// Goes long when the close breaks above the prior N-bar high; exits (or
/// flips short when enabled) when it breaks below the prior N-bar low.
/// The current bar is excluded from the channel, so a breakout compares
/// against history only.
pub struct BreakoutStrategy {
    id: String,
    symbol: String,
    highs: RollingHigh,
    lows: RollingLow,
    allow_short: bool,
    /// Strategy-local regime: -1, 0, +1.
    regime: i8,
}

impl BreakoutStrategy {
    pub fn new(
        id: impl Into<String>,
        symbol: impl Into<String>,
        lookback: usize,
        allow_short: bool,
    ) -> Result<Self, StrategyError> {
        if lookback < 2 {
            return Err(StrategyError::InvalidConfig(format!(
                "lookback must be at least 2, got {lookback}"
            )));
        }
        Ok(Self {
            id: id.into(),
            symbol: symbol.into(),
            highs: RollingHigh::new(lookback),
            lows: RollingLow::new(lookback),
            allow_short,
            regime: 0,
        })
    }

    fn emit(&self, direction: SignalDirection, reason: String, signals: &mut Vec<SignalEvent>) {
        signals.push(SignalEvent {
            strategy_id: self.id.clone(),
            symbol: self.symbol.clone(),
            direction,
            strength: 1.0,
            reason,
            target_weight: None,
        });
    }
}

impl Strategy for BreakoutStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn on_bar(&mut self, bar: &Bar, signals: &mut Vec<SignalEvent>) -> Result<(), StrategyError> {
        if bar.symbol != self.symbol {
            return Ok(());
        }
        let prior_high = self.highs.update(bar.high);
        let prior_low = self.lows.update(bar.low);
        let (Some(prior_high), Some(prior_low)) = (prior_high, prior_low) else {
            return Ok(());
        };

        if bar.close > prior_high && self.regime <= 0 {
            self.regime = 1;
            self.emit(
                SignalDirection::Long,
                format!("close {} above prior high {prior_high}", bar.close),
                signals,
            );
        } else if bar.close < prior_low && self.regime >= 0 {
            if self.allow_short {
                self.regime = -1;
                self.emit(
                    SignalDirection::Short,
                    format!("close {} below prior low {prior_low}", bar.close),
                    signals,
                );
            } else if self.regime > 0 {
                self.regime = 0;
                self.emit(
                    SignalDirection::Exit,
                    format!("close {} below prior low {prior_low}", bar.close),
                    signals,
                );
            }
        }
        Ok(())
    }
}
