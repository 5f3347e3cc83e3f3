//! The deterministic backtest kernel.
//!
//! One engine instance drives one run: a [`DataFeed`] produces bars, each
//! bar is published on a synchronous FIFO [`EventBus`] and dispatched
//! through the pipeline stages (strategies, portfolio + risk chain,
//! execution handler, reporters). Everything runs on a single thread; given
//! the same feed and configuration a run is bit-for-bit reproducible.
//!
//! The crate exposes:
//!
//! - **Bus**: [`EventBus`], [`Subscriber`], [`EventSink`]
//! - **Engine**: [`Engine`], [`EngineBuilder`], [`EngineSummary`]
//! - **Stage contracts**: [`DataFeed`], [`Strategy`], [`RiskRule`],
//!   [`Reporter`]
//! - **Built-ins**: in-memory and CSV feeds, moving-average and breakout
//!   strategies, the four canonical risk rules, the simulated execution
//!   handler, and the equity/detailed/trade-log reporters

mod bus;
mod cancel;
mod engine;
mod error;
mod execution;
mod feed;
mod portfolio;
mod report;
mod risk;
pub mod strategies;
mod traits;

pub use bus::{EventBus, EventSink, Subscriber};
pub use cancel::CancelToken;
pub use engine::{Engine, EngineBuilder, EngineConfig, EngineSummary};
pub use error::{EngineError, FeedError, ReporterError, StageError, StrategyError};
pub use execution::{ExecutionConfig, FillTiming, SimulatedExecution, SlippageModel};
pub use feed::{CsvBarFeed, InMemoryFeed};
pub use portfolio::{
    PendingOrder, PortfolioConfig, PortfolioStage, PortfolioState, Position, SizingRule,
    WeightAllocator,
};
pub use report::{DetailedReporter, EquityCurveReporter, TradeLogReporter};
pub use risk::{BuyingPowerRule, ConcentrationRule, MaxPositionRule, PriceBandRule, RiskVerdict};
pub use strategies::{BreakoutStrategy, MovingAverageStrategy};
pub use traits::{DataFeed, FeedItem, Reporter, RiskRule, Strategy};
