//! Rolling-window indicators.
//!
//! Each indicator returns `None` until its window is full, so strategies
//! stay quiet through warm-up.

use std::collections::VecDeque;

use rust_decimal::Decimal;

/// Simple moving average over a fixed window.
#[derive(Debug, Clone)]
pub struct Sma {
    period: usize,
    window: VecDeque<Decimal>,
    sum: Decimal,
}

impl Sma {
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "SMA period must be positive");
        Self {
            period,
            window: VecDeque::with_capacity(period),
            sum: Decimal::ZERO,
        }
    }

    pub fn update(&mut self, value: Decimal) -> Option<Decimal> {
        self.window.push_back(value);
        self.sum += value;
        if self.window.len() > self.period {
            if let Some(evicted) = self.window.pop_front() {
                self.sum -= evicted;
            }
        }
        (self.window.len() == self.period).then(|| self.sum / Decimal::from(self.period as i64))
    }
}

/// Highest value over the prior N updates, excluding the current one.
#[derive(Debug, Clone)]
pub struct RollingHigh {
    period: usize,
    window: VecDeque<Decimal>,
}

impl RollingHigh {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            window: VecDeque::with_capacity(period),
        }
    }

    /// Returns the prior-window high, then pushes `value`.
    pub fn update(&mut self, value: Decimal) -> Option<Decimal> {
        let prior = (self.window.len() == self.period)
            .then(|| self.window.iter().copied().max())
            .flatten();
        self.window.push_back(value);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
        prior
    }
}

/// Lowest value over the prior N updates, excluding the current one.
#[derive(Debug, Clone)]
pub struct RollingLow {
    period: usize,
    window: VecDeque<Decimal>,
}

impl RollingLow {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            window: VecDeque::with_capacity(period),
        }
    }

    /// Returns the prior-window low, then pushes `value`.
    pub fn update(&mut self, value: Decimal) -> Option<Decimal> {
        let prior = (self.window.len() == self.period)
            .then(|| self.window.iter().copied().min())
            .flatten();
        self.window.push_back(value);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
        prior
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn sma_warms_up_then_averages() {
        let mut sma = Sma::new(3);
        assert_eq!(sma.update(dec!(1)), None);
        assert_eq!(sma.update(dec!(2)), None);
        assert_eq!(sma.update(dec!(3)), Some(dec!(2)));
        assert_eq!(sma.update(dec!(7)), Some(dec!(4)));
    }

    #[test]
    fn rolling_high_excludes_current_bar() {
        let mut high = RollingHigh::new(2);
        assert_eq!(high.update(dec!(5)), None);
        assert_eq!(high.update(dec!(7)), None);
        // Prior window is [5, 7]; current value not included.
        assert_eq!(high.update(dec!(6)), Some(dec!(7)));
        // Prior window is [7, 6].
        assert_eq!(high.update(dec!(1)), Some(dec!(7)));
        // Prior window is [6, 1].
        assert_eq!(high.update(dec!(2)), Some(dec!(6)));
    }

    #[test]
    fn rolling_low_excludes_current_bar() {
        let mut low = RollingLow::new(2);
        assert_eq!(low.update(dec!(5)), None);
        assert_eq!(low.update(dec!(3)), None);
        assert_eq!(low.update(dec!(4)), Some(dec!(3)));
    }
}
