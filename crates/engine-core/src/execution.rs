//! Simulated broker.
//!
//! Subscribes to Order events (accept or reject) and Market events (price
//! resting orders against the incoming bar). Fill timing, slippage,
//! commission, volume-capped partial fills, time-in-force, and the
//! staleness guard are all configured here.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use model::{
    Bar, Event, EventRecord, FillEvent, OrderEvent, OrderSide, OrderType, RiskAlertEvent,
    Severity, TimeInForce,
};

use crate::bus::{EventSink, Subscriber};
use crate::error::StageError;

/// When a market order is priced relative to the bar that triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillTiming {
    /// Fill at the close of the triggering bar. Introduces look-ahead;
    /// useful for teaching, not recommended.
    CurrentClose,
    /// Defer the fill to the next bar's open.
    NextOpen,
}

/// Slippage applied against the side of the trade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlippageModel {
    None,
    /// Fraction of price (0.001 = 10 bps).
    Relative(Decimal),
    /// Absolute price offset.
    Absolute(Decimal),
    /// Basis points of price.
    BasisPoints(Decimal),
}

impl SlippageModel {
    /// Price after slippage: buys pay up, sells receive less.
    fn adjust(&self, price: Decimal, side: OrderSide) -> Decimal {
        let offset = match self {
            Self::None => Decimal::ZERO,
            Self::Relative(fraction) => price * fraction,
            Self::Absolute(abs) => *abs,
            Self::BasisPoints(bps) => price * bps / Decimal::from(10_000),
        };
        match side {
            OrderSide::Buy => price + offset,
            OrderSide::Sell => price - offset,
        }
    }
}

/// Simulated execution parameters.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub fill_timing: FillTiming,
    pub slippage: SlippageModel,
    /// Fixed commission per share.
    pub commission_per_share: Decimal,
    /// Commission as a fraction of notional.
    pub commission_rate: Decimal,
    /// Cap on fill quantity as a fraction of the bar's volume.
    pub volume_cap: Option<Decimal>,
    /// Reject orders when the symbol's last bar is older than this.
    pub staleness_threshold: Option<Duration>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fill_timing: FillTiming::NextOpen,
            slippage: SlippageModel::None,
            commission_per_share: Decimal::ZERO,
            commission_rate: Decimal::ZERO,
            volume_cap: None,
            staleness_threshold: None,
        }
    }
}

#[derive(Debug)]
struct RestingOrder {
    order: OrderEvent,
    remaining: i64,
    placed_at: DateTime<Utc>,
}

/// The execution pipeline stage.
pub struct SimulatedExecution {
    config: ExecutionConfig,
    last_bars: HashMap<String, Bar>,
    resting: Vec<RestingOrder>,
}

impl SimulatedExecution {
    pub fn new(config: ExecutionConfig) -> Self {
        Self {
            config,
            last_bars: HashMap::new(),
            resting: Vec::new(),
        }
    }

    /// Orders currently resting (tests and diagnostics).
    pub fn resting_orders(&self) -> usize {
        self.resting.len()
    }

    fn reject(sink: &mut EventSink<'_>, rule: &str, order: &OrderEvent, reason: String) {
        warn!(order_id = %order.order_id, rule, %reason, "order rejected by execution");
        sink.publish(Event::RiskAlert(RiskAlertEvent {
            rule: rule.to_string(),
            symbol: order.symbol.clone(),
            reason,
            severity: Severity::Warning,
            order_id: Some(order.order_id.clone()),
        }));
    }

    fn on_order(&mut self, record: &EventRecord, order: &OrderEvent, sink: &mut EventSink<'_>) {
        let last_bar = self.last_bars.get(&order.symbol);

        // Staleness guard: refuse to act on prices older than the threshold.
        if let Some(threshold) = self.config.staleness_threshold {
            match last_bar {
                Some(bar) if record.occurred_at - bar.timestamp > threshold => {
                    Self::reject(
                        sink,
                        "staleness",
                        order,
                        format!(
                            "last bar for {} is {}s old, threshold {}s",
                            order.symbol,
                            (record.occurred_at - bar.timestamp).num_seconds(),
                            threshold.num_seconds()
                        ),
                    );
                    return;
                }
                _ => {}
            }
        }

        let immediate = self.config.fill_timing == FillTiming::CurrentClose
            && order.order_type == OrderType::Market;

        if immediate {
            let Some(bar) = last_bar.cloned() else {
                Self::reject(
                    sink,
                    "execution",
                    order,
                    format!("no market data for {}", order.symbol),
                );
                return;
            };
            let mut resting = RestingOrder {
                order: order.clone(),
                remaining: order.quantity,
                placed_at: record.occurred_at,
            };
            fill_against_bar(&self.config, &mut resting, &bar, bar.close, sink);
            if resting.remaining == 0 {
                return;
            }
            if resting.order.time_in_force == TimeInForce::Ioc {
                debug!(order_id = %order.order_id, remaining = resting.remaining, "IOC remainder canceled");
            } else {
                self.resting.push(resting);
            }
            return;
        }

        // next_open market orders and all limit/stop orders rest until the
        // next bar for their symbol.
        self.resting.push(RestingOrder {
            order: order.clone(),
            remaining: order.quantity,
            placed_at: record.occurred_at,
        });
    }

    fn on_bar(&mut self, bar: &Bar, sink: &mut EventSink<'_>) {
        let mut index = 0;
        while index < self.resting.len() {
            if self.resting[index].order.symbol != bar.symbol {
                index += 1;
                continue;
            }

            // Expiry comes before any fill attempt.
            let expired = {
                let resting = &self.resting[index];
                let day_boundary = resting.order.time_in_force == TimeInForce::Day
                    && bar.timestamp.date_naive() > resting.placed_at.date_naive();
                let explicit = resting
                    .order
                    .expires_at
                    .is_some_and(|expiry| bar.timestamp > expiry);
                day_boundary || explicit
            };
            if expired {
                let resting = self.resting.remove(index);
                info!(
                    order_id = %resting.order.order_id,
                    remaining = resting.remaining,
                    "order expired"
                );
                continue;
            }

            let base_price = executable_price(&self.resting[index].order, bar);
            let Some(base_price) = base_price else {
                index += 1;
                continue;
            };

            fill_against_bar(&self.config, &mut self.resting[index], bar, base_price, sink);

            let remaining = self.resting[index].remaining;
            let time_in_force = self.resting[index].order.time_in_force;
            if remaining == 0 {
                self.resting.remove(index);
            } else if time_in_force == TimeInForce::Ioc {
                let resting = self.resting.remove(index);
                debug!(
                    order_id = %resting.order.order_id,
                    remaining = resting.remaining,
                    "IOC remainder canceled"
                );
            } else {
                index += 1;
            }
        }

        self.last_bars.insert(bar.symbol.clone(), bar.clone());
    }
}

/// Price at which an order is executable against this bar, if at all.
fn executable_price(order: &OrderEvent, bar: &Bar) -> Option<Decimal> {
    match order.order_type {
        OrderType::Market => Some(bar.open),
        OrderType::Limit => {
            let limit = order.price?;
            match order.side {
                // A resting buy fills when the bar trades at or below the
                // limit; if it gaps below, the open is the better price.
                OrderSide::Buy if bar.low <= limit => Some(bar.open.min(limit)),
                OrderSide::Sell if bar.high >= limit => Some(bar.open.max(limit)),
                _ => None,
            }
        }
        OrderType::Stop => {
            let stop = order.price?;
            match order.side {
                // A stop buy triggers when the bar crosses up through the
                // stop and fills at the stop or worse.
                OrderSide::Buy if bar.high >= stop => Some(bar.open.max(stop)),
                OrderSide::Sell if bar.low <= stop => Some(bar.open.min(stop)),
                _ => None,
            }
        }
    }
}

/// Fill as much of `resting` as the bar's volume cap allows at `base_price`
/// (before slippage). Returns whether any quantity filled.
fn fill_against_bar(
    config: &ExecutionConfig,
    resting: &mut RestingOrder,
    bar: &Bar,
    base_price: Decimal,
    sink: &mut EventSink<'_>,
) -> bool {
    let cap = match config.volume_cap {
        Some(fraction) => (fraction * bar.volume).floor().to_i64().unwrap_or(0),
        None => i64::MAX,
    };
    let quantity = resting.remaining.min(cap);
    if quantity <= 0 {
        debug!(
            order_id = %resting.order.order_id,
            cap,
            "no liquidity for fill on this bar"
        );
        return false;
    }

    let fill_price = config.slippage.adjust(base_price, resting.order.side);
    let slippage = (fill_price - base_price).abs();
    let notional = Decimal::from(quantity) * fill_price;
    let commission =
        config.commission_per_share * Decimal::from(quantity) + config.commission_rate * notional;

    resting.remaining -= quantity;

    sink.publish(Event::Fill(FillEvent {
        order_id: resting.order.order_id.clone(),
        symbol: resting.order.symbol.clone(),
        side: resting.order.side,
        quantity,
        fill_price,
        commission,
        slippage,
        remaining: resting.remaining,
        timestamp: bar.timestamp,
    }));
    true
}

impl Subscriber for SimulatedExecution {
    fn on_event(
        &mut self,
        event: &EventRecord,
        sink: &mut EventSink<'_>,
    ) -> Result<(), StageError> {
        match &event.payload {
            Event::Market(market) => self.on_bar(&market.bar, sink),
            Event::Order(order) => self.on_order(event, order, sink),
            _ => {}
        }
        Ok(())
    }
}
