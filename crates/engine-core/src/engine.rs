//! The engine: owns the bus, wires the pipeline, drives the feed.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use model::{Event, EventKind, EventRecord, MarketEvent, RiskAlertEvent, Severity};

use crate::bus::{EventBus, EventSink, Subscriber};
use crate::cancel::CancelToken;
use crate::error::{EngineError, StageError};
use crate::execution::{ExecutionConfig, SimulatedExecution};
use crate::portfolio::{PortfolioConfig, PortfolioStage, SizingRule};
use crate::traits::{DataFeed, FeedItem, Reporter, RiskRule, Strategy};

/// Engine identity and tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub run_id: String,
    pub name: String,
    /// Consecutive errors a single strategy may produce before the run is
    /// terminated.
    pub strike_budget: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_id: "local".to_string(),
            name: "backtest".to_string(),
            strike_budget: 25,
        }
    }
}

/// What the engine hands back when the feed is exhausted or the run is
/// canceled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSummary {
    pub run_id: String,
    pub name: String,
    pub bars: u64,
    pub fills: u64,
    pub rejections: u64,
    pub final_equity: Decimal,
    pub cash: Decimal,
    pub total_return: Decimal,
    pub max_drawdown: Decimal,
    pub canceled: bool,
}

/// Adapter putting a [`Strategy`] on the bus with a strike budget.
struct StrategyStage {
    strategy: Box<dyn Strategy>,
    strikes: u32,
    budget: u32,
}

impl Subscriber for StrategyStage {
    fn on_event(
        &mut self,
        event: &EventRecord,
        sink: &mut EventSink<'_>,
    ) -> Result<(), StageError> {
        let Event::Market(MarketEvent { bar }) = &event.payload else {
            return Ok(());
        };
        let mut signals = Vec::new();
        match self.strategy.on_bar(bar, &mut signals) {
            Ok(()) => {
                self.strikes = 0;
                for mut signal in signals {
                    signal.strength = signal.strength.clamp(0.0, 1.0);
                    sink.publish(Event::Signal(signal));
                }
                Ok(())
            }
            Err(err) => {
                self.strikes += 1;
                let strategy_id = self.strategy.id().to_string();
                sink.publish(Event::RiskAlert(RiskAlertEvent {
                    rule: "strategy".to_string(),
                    symbol: bar.symbol.clone(),
                    reason: format!("strategy {strategy_id} failed: {err}"),
                    severity: Severity::Warning,
                    order_id: None,
                }));
                if self.strikes >= self.budget {
                    return Err(StageError::Fatal(EngineError::StrikeBudgetExceeded {
                        strategy_id,
                        strikes: self.strikes,
                    }));
                }
                Err(StageError::Recoverable(format!(
                    "strategy {strategy_id}: {err}"
                )))
            }
        }
    }
}

/// Adapter putting a [`Reporter`] on the bus. Reporter failures never kill
/// the run.
struct ReporterStage {
    reporter: Box<dyn Reporter>,
}

impl Subscriber for ReporterStage {
    fn on_event(
        &mut self,
        event: &EventRecord,
        _sink: &mut EventSink<'_>,
    ) -> Result<(), StageError> {
        let result = match &event.payload {
            Event::Market(market) => self.reporter.on_market(&market.bar),
            Event::Fill(fill) => self.reporter.on_fill(fill),
            Event::Metrics(metrics) => self.reporter.on_metrics(metrics),
            _ => Ok(()),
        };
        result.map_err(|err| StageError::Recoverable(format!("reporter: {err}")))
    }
}

/// Builder assembling a wired engine.
pub struct EngineBuilder {
    config: EngineConfig,
    feed: Option<Box<dyn DataFeed>>,
    strategies: Vec<Box<dyn Strategy>>,
    portfolio: PortfolioConfig,
    risk_chain: Vec<Box<dyn RiskRule>>,
    execution: ExecutionConfig,
    reporters: Vec<Box<dyn Reporter>>,
    cancel: CancelToken,
    progress: Option<Box<dyn FnMut(f64)>>,
    tap: Option<Box<dyn FnMut(&EventRecord)>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            feed: None,
            strategies: Vec::new(),
            portfolio: PortfolioConfig {
                initial_cash: Decimal::from(100_000),
                sizing: SizingRule::FixedLot { lot_size: 100 },
                allow_short: false,
                default_tif: model::TimeInForce::Gtc,
            },
            risk_chain: Vec::new(),
            execution: ExecutionConfig::default(),
            reporters: Vec::new(),
            cancel: CancelToken::new(),
            progress: None,
            tap: None,
        }
    }

    pub fn feed(mut self, feed: Box<dyn DataFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn strategy(mut self, strategy: Box<dyn Strategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn portfolio(mut self, portfolio: PortfolioConfig) -> Self {
        self.portfolio = portfolio;
        self
    }

    pub fn risk_rule(mut self, rule: Box<dyn RiskRule>) -> Self {
        self.risk_chain.push(rule);
        self
    }

    pub fn execution(mut self, execution: ExecutionConfig) -> Self {
        self.execution = execution;
        self
    }

    pub fn reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Register a progress callback invoked after each bar with the
    /// fraction of the feed consumed.
    pub fn on_progress(mut self, callback: Box<dyn FnMut(f64)>) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Observe every dispatched event (used by the run worker relay).
    pub fn event_tap(mut self, tap: Box<dyn FnMut(&EventRecord)>) -> Self {
        self.tap = Some(tap);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        let feed = self
            .feed
            .ok_or_else(|| EngineError::Stage("engine requires a data feed".to_string()))?;

        let mut bus = EventBus::new(self.config.run_id.clone());
        if let Some(tap) = self.tap {
            bus.set_tap(tap);
        }

        let budget = self.config.strike_budget;
        let strategies: Vec<Rc<RefCell<StrategyStage>>> = self
            .strategies
            .into_iter()
            .map(|strategy| {
                Rc::new(RefCell::new(StrategyStage {
                    strategy,
                    strikes: 0,
                    budget,
                }))
            })
            .collect();
        let portfolio = Rc::new(RefCell::new(PortfolioStage::new(
            self.portfolio,
            self.risk_chain,
        )));
        let execution: Rc<RefCell<SimulatedExecution>> =
            Rc::new(RefCell::new(SimulatedExecution::new(self.execution)));
        let reporters: Vec<Rc<RefCell<ReporterStage>>> = self
            .reporters
            .into_iter()
            .map(|reporter| Rc::new(RefCell::new(ReporterStage { reporter })))
            .collect();

        // Wiring order defines handler invocation order per kind:
        // strategies see a bar first, then the portfolio marks, then the
        // execution handler prices resting orders, then reporters observe.
        for stage in &strategies {
            bus.subscribe(EventKind::Market, stage.clone())?;
        }
        bus.subscribe(EventKind::Market, portfolio.clone())?;
        bus.subscribe(EventKind::Signal, portfolio.clone())?;
        bus.subscribe(EventKind::Fill, portfolio.clone())?;
        bus.subscribe(EventKind::Market, execution.clone())?;
        bus.subscribe(EventKind::Order, execution)?;
        for stage in &reporters {
            bus.subscribe(EventKind::Market, stage.clone())?;
            bus.subscribe(EventKind::Fill, stage.clone())?;
            bus.subscribe(EventKind::Metrics, stage.clone())?;
        }

        Ok(Engine {
            config: self.config,
            bus,
            feed,
            strategies,
            portfolio,
            reporters,
            cancel: self.cancel,
            progress: self.progress,
            last_timestamp: None,
        })
    }
}

/// One run's kernel: feed, bus, and pipeline, driven to completion on the
/// calling thread.
pub struct Engine {
    config: EngineConfig,
    bus: EventBus,
    feed: Box<dyn DataFeed>,
    strategies: Vec<Rc<RefCell<StrategyStage>>>,
    portfolio: Rc<RefCell<PortfolioStage>>,
    reporters: Vec<Rc<RefCell<ReporterStage>>>,
    cancel: CancelToken,
    progress: Option<Box<dyn FnMut(f64)>>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Drive the feed to exhaustion (or cancellation), dispatching each bar
    /// through the pipeline, then emit a final metrics snapshot.
    pub fn run(&mut self) -> Result<EngineSummary, EngineError> {
        info!(run_id = %self.config.run_id, name = %self.config.name, "engine starting");

        for stage in &self.strategies {
            stage.borrow_mut().strategy.on_start();
        }
        for stage in &self.reporters {
            if let Err(err) = stage.borrow_mut().reporter.on_start() {
                return Err(EngineError::Stage(format!("reporter start failed: {err}")));
            }
        }

        let total = self.feed.len_hint();
        let mut consumed: u64 = 0;
        let mut canceled = false;

        loop {
            // Cancellation is cooperative: checked between feed steps only,
            // so a drain in progress always completes.
            if self.cancel.is_canceled() {
                canceled = true;
                break;
            }
            match self.feed.next()? {
                FeedItem::Bar(bar) => {
                    self.last_timestamp = Some(bar.timestamp);
                    self.bus
                        .publish(bar.timestamp, Event::Market(MarketEvent { bar }));
                    self.bus.drain()?;
                    consumed += 1;
                    if let Some(callback) = self.progress.as_mut() {
                        let fraction = total.map_or(0.0, |t| {
                            if t == 0 {
                                1.0
                            } else {
                                consumed as f64 / t as f64
                            }
                        });
                        callback(fraction.min(1.0));
                    }
                }
                FeedItem::Alert(alert) => {
                    let timestamp = self.last_timestamp.unwrap_or(DateTime::UNIX_EPOCH);
                    self.bus.publish(timestamp, Event::FeedAlert(alert));
                    self.bus.drain()?;
                }
                FeedItem::End => break,
            }
        }

        // Final metrics snapshot, also published for late consumers.
        let metrics = self.portfolio.borrow().state().metrics();
        let timestamp = self.last_timestamp.unwrap_or(DateTime::UNIX_EPOCH);
        self.bus.publish(timestamp, Event::Metrics(metrics));
        self.bus.drain()?;

        for stage in &self.strategies {
            stage.borrow_mut().strategy.on_finish();
        }
        for stage in &self.reporters {
            if let Err(err) = stage.borrow_mut().reporter.on_finish() {
                warn!(error = %err, "reporter finish failed");
            }
        }

        let portfolio = self.portfolio.borrow();
        let state = portfolio.state();
        let final_equity = state.equity();
        let total_return = if state.initial_cash > Decimal::ZERO {
            (final_equity - state.initial_cash) / state.initial_cash
        } else {
            Decimal::ZERO
        };
        let summary = EngineSummary {
            run_id: self.config.run_id.clone(),
            name: self.config.name.clone(),
            bars: consumed,
            fills: portfolio.fills(),
            rejections: portfolio.rejections(),
            final_equity,
            cash: state.cash,
            total_return,
            max_drawdown: portfolio.max_drawdown(),
            canceled,
        };
        info!(
            run_id = %self.config.run_id,
            bars = summary.bars,
            fills = summary.fills,
            final_equity = %summary.final_equity,
            canceled,
            "engine finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::InMemoryFeed;

    #[test]
    fn empty_feed_completes_with_initial_equity() {
        let mut engine = Engine::builder(EngineConfig::default())
            .feed(Box::new(InMemoryFeed::new(Vec::new())))
            .build()
            .unwrap();
        let summary = engine.run().unwrap();
        assert_eq!(summary.bars, 0);
        assert_eq!(summary.fills, 0);
        assert_eq!(summary.final_equity, Decimal::from(100_000));
        assert_eq!(summary.total_return, Decimal::ZERO);
        assert!(!summary.canceled);
    }

    #[test]
    fn canceled_before_start_consumes_nothing() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut engine = Engine::builder(EngineConfig::default())
            .feed(Box::new(InMemoryFeed::new(Vec::new())))
            .cancel_token(cancel)
            .build()
            .unwrap();
        let summary = engine.run().unwrap();
        assert!(summary.canceled);
        assert_eq!(summary.bars, 0);
    }
}
