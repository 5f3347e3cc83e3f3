//! Pipeline stage contracts.

use model::{Bar, FeedAlertEvent, FillEvent, MetricsEvent, OrderEvent, SignalEvent};

use crate::error::{FeedError, ReporterError, StrategyError};
use crate::portfolio::PortfolioState;
use crate::risk::RiskVerdict;

/// One pull from a data feed.
#[derive(Debug, Clone)]
pub enum FeedItem {
    /// The next bar in timestamp order.
    Bar(Bar),
    /// Feed health information (heartbeat timeout, gap, reconnect). The
    /// engine publishes these on the bus without advancing the clock.
    Alert(FeedAlertEvent),
    /// The feed is exhausted. Historical feeds reach this; live feeds only
    /// on shutdown.
    End,
}

/// Source of market data.
///
/// Produces a lazy sequence of bars, finite for historical data and
/// potentially infinite for live data. Feeds are not restartable. `next`
/// may block while a live feed awaits a new tick; it is the engine's only
/// suspension point.
pub trait DataFeed {
    fn next(&mut self) -> Result<FeedItem, FeedError>;

    /// Number of bars this feed will produce, when known. Drives progress
    /// reporting; live feeds return `None`.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// Turns market data into trading signals.
///
/// Strategies hold per-symbol state (rolling windows and the like), must be
/// deterministic given the same event sequence, and must not touch external
/// I/O. A strategy may emit any number of signals per bar.
pub trait Strategy {
    /// Stable identifier, used in signal attribution and dedupe keys.
    fn id(&self) -> &str;

    /// Called once before the first bar.
    fn on_start(&mut self) {}

    /// React to a bar, pushing zero or more signals.
    fn on_bar(&mut self, bar: &Bar, signals: &mut Vec<SignalEvent>) -> Result<(), StrategyError>;

    /// Called once after the feed is exhausted or the run is canceled.
    fn on_finish(&mut self) {}
}

/// A single pre-trade risk check.
///
/// Rules are consulted in chain order by the portfolio before an order is
/// published; the chain short-circuits on the first rejection. A rule may
/// also rewrite the order (e.g. clamp its quantity).
pub trait RiskRule {
    fn name(&self) -> &'static str;

    fn check(&self, order: &OrderEvent, portfolio: &PortfolioState) -> RiskVerdict;
}

/// A performance reporter. Reporters are pure-append: each writes only to
/// its own sink and never publishes back onto the bus.
pub trait Reporter {
    fn on_start(&mut self) -> Result<(), ReporterError> {
        Ok(())
    }

    fn on_market(&mut self, _bar: &Bar) -> Result<(), ReporterError> {
        Ok(())
    }

    fn on_fill(&mut self, _fill: &FillEvent) -> Result<(), ReporterError> {
        Ok(())
    }

    fn on_metrics(&mut self, _metrics: &MetricsEvent) -> Result<(), ReporterError> {
        Ok(())
    }

    fn on_finish(&mut self) -> Result<(), ReporterError> {
        Ok(())
    }
}
