//! Portfolio stage: signal sizing, risk-chain consultation, and position
//! bookkeeping.

use std::collections::BTreeMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use model::{
    Event, EventRecord, FillEvent, MetricsEvent, OrderEvent, OrderSide, OrderType, RiskAlertEvent,
    Severity, SignalDirection, SignalEvent, TimeInForce,
};

use crate::bus::{EventSink, Subscriber};
use crate::error::StageError;
use crate::risk::RiskVerdict;
use crate::traits::RiskRule;

/// Net position in one symbol.
///
/// `avg_cost` is undefined (zero) while the position is flat. Reducing a
/// position realizes PnL on the closed portion; reversing through zero
/// re-enters at the fill price.
#[derive(Debug, Clone, Default)]
pub struct Position {
    /// Net units: positive long, negative short.
    pub quantity: i64,
    /// Volume-weighted average entry price.
    pub avg_cost: Decimal,
    /// Last mark price seen for the symbol.
    pub last_price: Decimal,
    /// Realized PnL from closed portions.
    pub realized_pnl: Decimal,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.quantity == 0
    }

    /// Unrealized PnL at the current mark.
    pub fn unrealized_pnl(&self) -> Decimal {
        if self.is_flat() {
            Decimal::ZERO
        } else {
            (self.last_price - self.avg_cost) * Decimal::from(self.quantity)
        }
    }

    /// Absolute notional at the current mark.
    pub fn notional(&self) -> Decimal {
        Decimal::from(self.quantity.abs()) * self.last_price
    }

    /// Apply a fill to this position, updating quantity, average cost, and
    /// realized PnL.
    pub fn apply_fill(&mut self, side: OrderSide, quantity: i64, price: Decimal) {
        if quantity == 0 {
            return;
        }
        let delta = side.sign() * quantity;
        let old_qty = self.quantity;
        let new_qty = old_qty + delta;

        if old_qty == 0 {
            self.avg_cost = price;
        } else if old_qty.signum() == delta.signum() {
            // Adding to the position: weighted average entry.
            let old_cost = Decimal::from(old_qty.abs()) * self.avg_cost;
            let add_cost = Decimal::from(quantity) * price;
            self.avg_cost = (old_cost + add_cost) / Decimal::from(old_qty.abs() + quantity);
        } else {
            // Reducing or reversing: realize PnL on the closed portion.
            let closed = quantity.min(old_qty.abs());
            let per_unit = if old_qty > 0 {
                price - self.avg_cost
            } else {
                self.avg_cost - price
            };
            self.realized_pnl += per_unit * Decimal::from(closed);

            if new_qty != 0 && new_qty.signum() != old_qty.signum() {
                self.avg_cost = price;
            }
        }

        self.quantity = new_qty;
        if self.is_flat() {
            self.avg_cost = Decimal::ZERO;
        }
    }
}

/// An order published but not yet fully filled.
#[derive(Debug, Clone)]
pub struct PendingOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i64,
}

/// Cash, positions, and pending order references.
///
/// Invariant: `cash + Σ(position.qty × mark)` equals equity; equity is a
/// pure function of this state after each fill or mark-to-market.
#[derive(Debug, Clone)]
pub struct PortfolioState {
    pub initial_cash: Decimal,
    pub cash: Decimal,
    pub positions: BTreeMap<String, Position>,
    pub commission_paid: Decimal,
    /// Orders published but not yet fully filled, keyed by order id.
    pub pending_orders: BTreeMap<String, PendingOrder>,
}

impl PortfolioState {
    pub fn new(initial_cash: Decimal) -> Self {
        Self {
            initial_cash,
            cash: initial_cash,
            positions: BTreeMap::new(),
            commission_paid: Decimal::ZERO,
            pending_orders: BTreeMap::new(),
        }
    }

    pub fn mark(&mut self, symbol: &str, price: Decimal) {
        if let Some(position) = self.positions.get_mut(symbol) {
            position.last_price = price;
        }
    }

    pub fn quantity(&self, symbol: &str) -> i64 {
        self.positions.get(symbol).map_or(0, |p| p.quantity)
    }

    /// Signed quantity of unfilled orders for a symbol. Risk checks count
    /// this toward post-fill exposure so in-flight orders cannot stack past
    /// a limit.
    pub fn open_quantity(&self, symbol: &str) -> i64 {
        self.pending_orders
            .values()
            .filter(|pending| pending.symbol == symbol)
            .map(|pending| pending.side.sign() * pending.quantity)
            .sum()
    }

    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.positions
            .get(symbol)
            .filter(|p| p.last_price > Decimal::ZERO)
            .map(|p| p.last_price)
    }

    /// Marked-to-market equity.
    pub fn equity(&self) -> Decimal {
        let inventory: Decimal = self
            .positions
            .values()
            .map(|p| Decimal::from(p.quantity) * p.last_price)
            .sum();
        self.cash + inventory
    }

    /// Sum of absolute position notionals.
    pub fn gross_exposure(&self) -> Decimal {
        self.positions.values().map(Position::notional).sum()
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.realized_pnl).sum()
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.positions.values().map(Position::unrealized_pnl).sum()
    }

    /// Apply a fill: position update plus cash and commission movement.
    pub fn apply_fill(&mut self, fill: &FillEvent) {
        let position = self.positions.entry(fill.symbol.clone()).or_default();
        position.apply_fill(fill.side, fill.quantity, fill.fill_price);
        position.last_price = fill.fill_price;

        self.cash -= Decimal::from(fill.signed_quantity()) * fill.fill_price;
        self.cash -= fill.commission;
        self.commission_paid += fill.commission;

        if fill.remaining == 0 {
            self.pending_orders.remove(&fill.order_id);
        } else if let Some(pending) = self.pending_orders.get_mut(&fill.order_id) {
            pending.quantity = fill.remaining;
        }
    }

    pub fn holdings(&self) -> BTreeMap<String, i64> {
        self.positions
            .iter()
            .filter(|(_, p)| !p.is_flat())
            .map(|(s, p)| (s.clone(), p.quantity))
            .collect()
    }

    /// Snapshot for a `MetricsEvent`.
    pub fn metrics(&self) -> MetricsEvent {
        MetricsEvent {
            equity: self.equity(),
            cash: self.cash,
            realized_pnl: self.realized_pnl(),
            unrealized_pnl: self.unrealized_pnl(),
            holdings: self.holdings(),
        }
    }
}

/// Converts a target weight into integer units.
///
/// Clamps the weight to the leverage cap and rounds the raw unit count to
/// the lot size (half-up).
#[derive(Debug, Clone)]
pub struct WeightAllocator {
    pub max_leverage: Decimal,
    pub lot_size: i64,
}

impl WeightAllocator {
    pub fn units_for(&self, weight: Decimal, equity: Decimal, price: Decimal) -> i64 {
        if equity <= Decimal::ZERO || price <= Decimal::ZERO || self.lot_size <= 0 {
            return 0;
        }
        let clamped = weight.clamp(-self.max_leverage, self.max_leverage);
        let target_value = equity * clamped;
        let raw_units = target_value / price;
        let lot = Decimal::from(self.lot_size);
        let lots = (raw_units / lot).round();
        (lots * lot).to_i64().unwrap_or(0)
    }
}

/// Position-sizing rule applied to incoming signals.
#[derive(Debug, Clone)]
pub enum SizingRule {
    /// Target a fixed number of units per direction.
    FixedLot { lot_size: i64 },
    /// Target a fractional exposure via the allocator.
    TargetWeight { allocator: WeightAllocator },
}

/// Portfolio construction parameters.
#[derive(Debug, Clone)]
pub struct PortfolioConfig {
    pub initial_cash: Decimal,
    pub sizing: SizingRule,
    /// When false the portfolio is long-only: short signals are rejected
    /// and sells never exceed inventory.
    pub allow_short: bool,
    pub default_tif: TimeInForce,
}

/// The portfolio pipeline stage.
///
/// Subscribes to Market (mark-to-market), Signal (sizing + risk chain +
/// order emission), and Fill (bookkeeping + metrics emission).
pub struct PortfolioStage {
    config: PortfolioConfig,
    state: PortfolioState,
    risk_chain: Vec<Box<dyn RiskRule>>,
    next_order_id: u64,
    fills: u64,
    rejections: u64,
    peak_equity: Decimal,
    max_drawdown: Decimal,
}

impl PortfolioStage {
    pub fn new(config: PortfolioConfig, risk_chain: Vec<Box<dyn RiskRule>>) -> Self {
        let state = PortfolioState::new(config.initial_cash);
        let peak_equity = config.initial_cash;
        Self {
            config,
            state,
            risk_chain,
            next_order_id: 0,
            fills: 0,
            rejections: 0,
            peak_equity,
            max_drawdown: Decimal::ZERO,
        }
    }

    pub fn state(&self) -> &PortfolioState {
        &self.state
    }

    pub fn fills(&self) -> u64 {
        self.fills
    }

    pub fn rejections(&self) -> u64 {
        self.rejections
    }

    /// Max drawdown observed so far, as a fraction of peak equity.
    pub fn max_drawdown(&self) -> Decimal {
        self.max_drawdown
    }

    fn reject(&mut self, sink: &mut EventSink<'_>, rule: &str, symbol: &str, reason: String) {
        self.rejections += 1;
        warn!(rule, symbol, %reason, "signal rejected");
        sink.publish(Event::RiskAlert(RiskAlertEvent {
            rule: rule.to_string(),
            symbol: symbol.to_string(),
            reason,
            severity: Severity::Warning,
            order_id: None,
        }));
    }

    /// Signed change in units this signal asks for.
    ///
    /// Fixed-lot sizing is additive (each long signal buys one more lot);
    /// weight sizing targets an absolute exposure and trades the
    /// difference. Exit always flattens.
    fn delta_quantity(&self, signal: &SignalEvent, price: Decimal, current: i64) -> i64 {
        match (&self.config.sizing, signal.direction) {
            (_, SignalDirection::Exit) => -current,
            (SizingRule::FixedLot { lot_size }, SignalDirection::Long) => *lot_size,
            (SizingRule::FixedLot { lot_size }, SignalDirection::Short) => -lot_size,
            (SizingRule::TargetWeight { allocator }, direction) => {
                let magnitude = signal.target_weight.unwrap_or_else(|| {
                    Decimal::try_from(signal.strength).unwrap_or(Decimal::ONE)
                });
                let weight = match direction {
                    SignalDirection::Long => magnitude,
                    SignalDirection::Short => -magnitude,
                    SignalDirection::Exit => unreachable!(),
                };
                allocator.units_for(weight, self.state.equity(), price) - current
            }
        }
    }

    fn on_signal(&mut self, record: &EventRecord, signal: &SignalEvent, sink: &mut EventSink<'_>) {
        if signal.strength <= 0.0 {
            debug!(strategy_id = %signal.strategy_id, symbol = %signal.symbol, "zero-strength signal ignored");
            return;
        }
        if !self.config.allow_short && signal.direction == SignalDirection::Short {
            self.reject(
                sink,
                "portfolio",
                &signal.symbol,
                "short signal on a long-only portfolio".into(),
            );
            return;
        }

        let Some(price) = self.state.last_price(&signal.symbol) else {
            self.reject(
                sink,
                "portfolio",
                &signal.symbol,
                format!("no market data for {}", signal.symbol),
            );
            return;
        };

        let current = self.state.quantity(&signal.symbol);
        let delta = self.delta_quantity(signal, price, current);
        if delta == 0 {
            debug!(symbol = %signal.symbol, current, "signal requires no trade");
            return;
        }

        let side = if delta > 0 { OrderSide::Buy } else { OrderSide::Sell };
        let quantity = delta.abs();

        // Basic affordability and inventory checks before the risk chain.
        if side == OrderSide::Buy {
            let required = Decimal::from(quantity) * price;
            if required > self.state.cash {
                self.reject(
                    sink,
                    "portfolio",
                    &signal.symbol,
                    format!("insufficient cash: need {required}, have {}", self.state.cash),
                );
                return;
            }
        } else if !self.config.allow_short && quantity > current {
            self.reject(
                sink,
                "portfolio",
                &signal.symbol,
                format!("insufficient inventory: selling {quantity}, hold {current}"),
            );
            return;
        }

        self.next_order_id += 1;
        let mut order = OrderEvent {
            order_id: format!("ord-{}", self.next_order_id),
            symbol: signal.symbol.clone(),
            side,
            quantity,
            order_type: OrderType::Market,
            price: None,
            time_in_force: self.config.default_tif,
            signal_id: Some(record.trace_id.clone()),
            expires_at: None,
        };

        for rule in &self.risk_chain {
            match rule.check(&order, &self.state) {
                RiskVerdict::Approve => {}
                RiskVerdict::Modify(modified) => {
                    info!(
                        rule = rule.name(),
                        order_id = %order.order_id,
                        quantity = modified.quantity,
                        "order modified by risk rule"
                    );
                    order = modified;
                }
                RiskVerdict::Reject { reason } => {
                    self.rejections += 1;
                    warn!(rule = rule.name(), order_id = %order.order_id, %reason, "order rejected");
                    sink.publish(Event::RiskAlert(RiskAlertEvent {
                        rule: rule.name().to_string(),
                        symbol: order.symbol.clone(),
                        reason,
                        severity: Severity::Warning,
                        order_id: Some(order.order_id.clone()),
                    }));
                    return;
                }
            }
        }

        self.state.pending_orders.insert(
            order.order_id.clone(),
            PendingOrder {
                symbol: order.symbol.clone(),
                side: order.side,
                quantity: order.quantity,
            },
        );
        sink.publish(Event::Order(order));
    }

    fn on_fill(&mut self, fill: &FillEvent, sink: &mut EventSink<'_>) {
        self.state.apply_fill(fill);
        self.fills += 1;
        self.track_drawdown();
        sink.publish(Event::Metrics(self.state.metrics()));
    }

    fn track_drawdown(&mut self) {
        let equity = self.state.equity();
        if equity > self.peak_equity {
            self.peak_equity = equity;
        } else if self.peak_equity > Decimal::ZERO {
            let drawdown = (self.peak_equity - equity) / self.peak_equity;
            if drawdown > self.max_drawdown {
                self.max_drawdown = drawdown;
            }
        }
    }
}

impl Subscriber for PortfolioStage {
    fn on_event(
        &mut self,
        event: &EventRecord,
        sink: &mut EventSink<'_>,
    ) -> Result<(), StageError> {
        match &event.payload {
            Event::Market(market) => {
                self.state.mark(&market.bar.symbol, market.bar.close);
                self.track_drawdown();
            }
            Event::Signal(signal) => self.on_signal(event, signal, sink),
            Event::Fill(fill) => self.on_fill(fill, sink),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn position_open_add_close() {
        let mut position = Position::default();
        position.apply_fill(OrderSide::Buy, 100, dec!(10));
        assert_eq!(position.quantity, 100);
        assert_eq!(position.avg_cost, dec!(10));

        position.apply_fill(OrderSide::Buy, 100, dec!(12));
        assert_eq!(position.quantity, 200);
        assert_eq!(position.avg_cost, dec!(11));

        position.apply_fill(OrderSide::Sell, 200, dec!(13));
        assert!(position.is_flat());
        assert_eq!(position.realized_pnl, dec!(400));
        assert_eq!(position.avg_cost, dec!(0));
    }

    #[test]
    fn position_reversal_reenters_at_fill_price() {
        let mut position = Position::default();
        position.apply_fill(OrderSide::Buy, 100, dec!(10));
        position.apply_fill(OrderSide::Sell, 150, dec!(11));
        assert_eq!(position.quantity, -50);
        assert_eq!(position.avg_cost, dec!(11));
        assert_eq!(position.realized_pnl, dec!(100));
    }

    #[test]
    fn cash_is_conserved_through_fills() {
        let mut state = PortfolioState::new(dec!(100_000));
        let fill = FillEvent {
            order_id: "ord-1".into(),
            symbol: "SPY".into(),
            side: OrderSide::Buy,
            quantity: 100,
            fill_price: dec!(100),
            commission: dec!(5),
            slippage: dec!(0),
            remaining: 0,
            timestamp: chrono::Utc::now(),
        };
        state.apply_fill(&fill);

        // cash' + qty*fill_price == cash - commission
        let lhs = state.cash + Decimal::from(state.quantity("SPY")) * dec!(100);
        assert_eq!(lhs, dec!(100_000) - dec!(5));
        assert_eq!(state.commission_paid, dec!(5));
    }

    #[test]
    fn allocator_rounds_to_lot() {
        let allocator = WeightAllocator {
            max_leverage: dec!(1),
            lot_size: 100,
        };
        // 50% of 100k at price 42.0 -> 1190.47 units -> 1200 after rounding
        assert_eq!(allocator.units_for(dec!(0.5), dec!(100_000), dec!(42)), 1200);
        // Leverage clamp: weight 3.0 behaves as 1.0
        assert_eq!(
            allocator.units_for(dec!(3), dec!(100_000), dec!(100)),
            allocator.units_for(dec!(1), dec!(100_000), dec!(100)),
        );
        assert_eq!(allocator.units_for(dec!(0.5), dec!(0), dec!(42)), 0);
    }
}
