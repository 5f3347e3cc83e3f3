//! Pre-trade risk rules.
//!
//! Each rule inspects an order against the current portfolio state and
//! returns a verdict. The portfolio walks its chain in order and
//! short-circuits on the first rejection; `Modify` rewrites the order and
//! the chain continues with the result.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use model::{OrderEvent, OrderSide};

use crate::portfolio::PortfolioState;
use crate::traits::RiskRule;

/// Outcome of a single risk check.
#[derive(Debug, Clone)]
pub enum RiskVerdict {
    /// The order may proceed to the next rule (or to execution).
    Approve,
    /// The order must not execute; the reason is surfaced as a risk alert.
    Reject { reason: String },
    /// The order may proceed in this rewritten form.
    Modify(OrderEvent),
}

impl RiskVerdict {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }
}

/// Rejects orders whose post-fill absolute quantity would exceed a cap.
#[derive(Debug, Clone)]
pub struct MaxPositionRule {
    pub limit: i64,
}

impl RiskRule for MaxPositionRule {
    fn name(&self) -> &'static str {
        "max_position"
    }

    fn check(&self, order: &OrderEvent, portfolio: &PortfolioState) -> RiskVerdict {
        // In-flight orders count toward exposure, otherwise orders placed
        // before their predecessors fill would stack past the limit.
        let committed = portfolio.quantity(&order.symbol) + portfolio.open_quantity(&order.symbol);
        let after = committed + order.side.sign() * order.quantity;
        if after.abs() > self.limit {
            RiskVerdict::reject(format!(
                "post-fill position {} exceeds limit {} for {}",
                after, self.limit, order.symbol
            ))
        } else {
            RiskVerdict::Approve
        }
    }
}

/// Rejects buys whose notional (plus a fee buffer) exceeds available cash.
#[derive(Debug, Clone)]
pub struct BuyingPowerRule {
    /// Fee buffer as a fraction of notional (e.g. 0.001).
    pub fee_rate: Decimal,
}

impl RiskRule for BuyingPowerRule {
    fn name(&self) -> &'static str {
        "buying_power"
    }

    fn check(&self, order: &OrderEvent, portfolio: &PortfolioState) -> RiskVerdict {
        if order.side == OrderSide::Sell {
            return RiskVerdict::Approve;
        }
        let Some(price) = reference_price(order, portfolio) else {
            return RiskVerdict::reject(format!("no reference price for {}", order.symbol));
        };
        let notional = Decimal::from(order.quantity) * price;
        let required = notional * (Decimal::ONE + self.fee_rate);
        if required > portfolio.cash {
            RiskVerdict::reject(format!(
                "order notional {required} exceeds available cash {}",
                portfolio.cash
            ))
        } else {
            RiskVerdict::Approve
        }
    }
}

/// Rejects orders that would concentrate more than a fraction of equity in
/// one symbol.
#[derive(Debug, Clone)]
pub struct ConcentrationRule {
    /// Maximum post-fill exposure to a symbol, as a fraction of equity.
    pub max_fraction: Decimal,
}

impl RiskRule for ConcentrationRule {
    fn name(&self) -> &'static str {
        "concentration"
    }

    fn check(&self, order: &OrderEvent, portfolio: &PortfolioState) -> RiskVerdict {
        let Some(price) = reference_price(order, portfolio) else {
            return RiskVerdict::reject(format!("no reference price for {}", order.symbol));
        };
        let equity = portfolio.equity();
        if equity <= Decimal::ZERO {
            return RiskVerdict::reject("equity is not positive".to_string());
        }
        let committed = portfolio.quantity(&order.symbol) + portfolio.open_quantity(&order.symbol);
        let after = committed + order.side.sign() * order.quantity;
        let exposure = Decimal::from(after.abs()) * price;
        let cap = equity * self.max_fraction;
        if exposure > cap {
            RiskVerdict::reject(format!(
                "post-fill exposure {exposure} for {} exceeds {} of equity ({cap})",
                order.symbol, self.max_fraction
            ))
        } else {
            RiskVerdict::Approve
        }
    }
}

/// Rejects limit/stop orders priced too far from the last close.
#[derive(Debug, Clone)]
pub struct PriceBandRule {
    /// Allowed deviation from the last close, as a fraction (e.g. 0.1).
    pub band: Decimal,
}

impl RiskRule for PriceBandRule {
    fn name(&self) -> &'static str {
        "price_band"
    }

    fn check(&self, order: &OrderEvent, portfolio: &PortfolioState) -> RiskVerdict {
        // Market orders have no reference price of their own.
        let Some(order_price) = order.price else {
            return RiskVerdict::Approve;
        };
        let Some(close) = portfolio.last_price(&order.symbol) else {
            return RiskVerdict::reject(format!("no last close for {}", order.symbol));
        };
        if close <= Decimal::ZERO {
            return RiskVerdict::reject(format!("non-positive last close for {}", order.symbol));
        }
        let deviation = ((order_price - close) / close).abs();
        if deviation > self.band {
            RiskVerdict::reject(format!(
                "order price {order_price} deviates {:.4}% from close {close}, band {}%",
                (deviation * Decimal::from(100)).to_f64().unwrap_or(0.0),
                self.band * Decimal::from(100)
            ))
        } else {
            RiskVerdict::Approve
        }
    }
}

fn reference_price(order: &OrderEvent, portfolio: &PortfolioState) -> Option<Decimal> {
    order.price.or_else(|| portfolio.last_price(&order.symbol))
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{FillEvent, OrderType, TimeInForce};
    use rust_decimal_macros::dec;

    fn order(side: OrderSide, quantity: i64) -> OrderEvent {
        OrderEvent {
            order_id: "ord-1".into(),
            symbol: "SPY".into(),
            side,
            quantity,
            order_type: OrderType::Market,
            price: None,
            time_in_force: TimeInForce::Gtc,
            signal_id: None,
            expires_at: None,
        }
    }

    fn portfolio_with_position(quantity: i64, price: Decimal) -> PortfolioState {
        let mut state = PortfolioState::new(dec!(100_000));
        if quantity != 0 {
            state.apply_fill(&FillEvent {
                order_id: "seed".into(),
                symbol: "SPY".into(),
                side: OrderSide::Buy,
                quantity,
                fill_price: price,
                commission: dec!(0),
                slippage: dec!(0),
                remaining: 0,
                timestamp: chrono::Utc::now(),
            });
        } else {
            // Seed a mark so rules have a reference price.
            state.positions.insert(
                "SPY".into(),
                crate::portfolio::Position {
                    quantity: 0,
                    avg_cost: dec!(0),
                    last_price: price,
                    realized_pnl: dec!(0),
                },
            );
        }
        state
    }

    #[test]
    fn max_position_rejects_over_cap() {
        let rule = MaxPositionRule { limit: 200 };
        let state = portfolio_with_position(150, dec!(100));
        assert!(matches!(
            rule.check(&order(OrderSide::Buy, 100), &state),
            RiskVerdict::Reject { .. }
        ));
        assert!(matches!(
            rule.check(&order(OrderSide::Buy, 50), &state),
            RiskVerdict::Approve
        ));
        // Sells that reduce the position are fine.
        assert!(matches!(
            rule.check(&order(OrderSide::Sell, 150), &state),
            RiskVerdict::Approve
        ));
    }

    #[test]
    fn buying_power_rejects_unaffordable_order() {
        let rule = BuyingPowerRule { fee_rate: dec!(0) };
        let state = portfolio_with_position(0, dec!(100));
        // 100k cash, 100/share: 1_001 shares is too many.
        assert!(matches!(
            rule.check(&order(OrderSide::Buy, 1_001), &state),
            RiskVerdict::Reject { .. }
        ));
        assert!(matches!(
            rule.check(&order(OrderSide::Buy, 1_000), &state),
            RiskVerdict::Approve
        ));
        // Sells are exempt.
        assert!(matches!(
            rule.check(&order(OrderSide::Sell, 10_000), &state),
            RiskVerdict::Approve
        ));
    }

    #[test]
    fn concentration_rejects_over_fraction() {
        let rule = ConcentrationRule {
            max_fraction: dec!(0.5),
        };
        let state = portfolio_with_position(0, dec!(100));
        // Equity 100k, cap 50k -> 501 shares at 100 exceeds it.
        assert!(matches!(
            rule.check(&order(OrderSide::Buy, 501), &state),
            RiskVerdict::Reject { .. }
        ));
        assert!(matches!(
            rule.check(&order(OrderSide::Buy, 500), &state),
            RiskVerdict::Approve
        ));
    }

    #[test]
    fn price_band_checks_limit_price_deviation() {
        let rule = PriceBandRule { band: dec!(0.1) };
        let state = portfolio_with_position(0, dec!(100));

        let mut limit_order = order(OrderSide::Buy, 10);
        limit_order.order_type = OrderType::Limit;
        limit_order.price = Some(dec!(115));
        assert!(matches!(
            rule.check(&limit_order, &state),
            RiskVerdict::Reject { .. }
        ));

        limit_order.price = Some(dec!(105));
        assert!(matches!(rule.check(&limit_order, &state), RiskVerdict::Approve));

        // Market orders pass untouched.
        assert!(matches!(
            rule.check(&order(OrderSide::Buy, 10), &state),
            RiskVerdict::Approve
        ));
    }
}
