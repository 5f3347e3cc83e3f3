//! Reporters: pure-append observers of the run.
//!
//! Each reporter writes only to its own sink and never publishes back onto
//! the bus. Trade-log persistence is an independent writer, eventually
//! consistent with the portfolio's internal state.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use model::{Bar, FillEvent, MetricsEvent};

use crate::error::ReporterError;
use crate::portfolio::Position;
use crate::traits::Reporter;

/// Records (timestamp, equity) per metrics event.
///
/// With a sink path set, the curve is written as CSV on finish.
pub struct EquityCurveReporter {
    curve: Vec<(DateTime<Utc>, Decimal)>,
    last_timestamp: Option<DateTime<Utc>>,
    sink: Option<PathBuf>,
}

impl EquityCurveReporter {
    pub fn new(sink: Option<PathBuf>) -> Self {
        Self {
            curve: Vec::new(),
            last_timestamp: None,
            sink,
        }
    }

    pub fn curve(&self) -> &[(DateTime<Utc>, Decimal)] {
        &self.curve
    }
}

impl Reporter for EquityCurveReporter {
    fn on_market(&mut self, bar: &Bar) -> Result<(), ReporterError> {
        self.last_timestamp = Some(bar.timestamp);
        Ok(())
    }

    fn on_metrics(&mut self, metrics: &MetricsEvent) -> Result<(), ReporterError> {
        let timestamp = self.last_timestamp.unwrap_or(DateTime::UNIX_EPOCH);
        self.curve.push((timestamp, metrics.equity));
        Ok(())
    }

    fn on_finish(&mut self) -> Result<(), ReporterError> {
        let Some(path) = &self.sink else {
            return Ok(());
        };
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "timestamp,equity")?;
        for (timestamp, equity) in &self.curve {
            writeln!(writer, "{},{}", timestamp.to_rfc3339(), equity)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// One closed or partial trade as recorded by the detailed reporter.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub side: String,
    pub quantity: i64,
    pub price: Decimal,
    pub commission: Decimal,
    /// Realized PnL contributed by this fill (zero for opening fills).
    pub realized_pnl: Decimal,
    pub position_after: i64,
}

/// Per-trade log plus running max drawdown.
pub struct DetailedReporter {
    positions: BTreeMap<String, Position>,
    trades: Vec<TradeRecord>,
    peak_equity: Option<Decimal>,
    max_drawdown: Decimal,
    sink: Option<PathBuf>,
}

impl DetailedReporter {
    pub fn new(sink: Option<PathBuf>) -> Self {
        Self {
            positions: BTreeMap::new(),
            trades: Vec::new(),
            peak_equity: None,
            max_drawdown: Decimal::ZERO,
            sink,
        }
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    /// Max drawdown as a fraction of peak equity.
    pub fn max_drawdown(&self) -> Decimal {
        self.max_drawdown
    }
}

impl Reporter for DetailedReporter {
    fn on_fill(&mut self, fill: &FillEvent) -> Result<(), ReporterError> {
        let position = self.positions.entry(fill.symbol.clone()).or_default();
        let realized_before = position.realized_pnl;
        position.apply_fill(fill.side, fill.quantity, fill.fill_price);

        self.trades.push(TradeRecord {
            timestamp: fill.timestamp,
            symbol: fill.symbol.clone(),
            side: fill.side.as_str().to_string(),
            quantity: fill.quantity,
            price: fill.fill_price,
            commission: fill.commission,
            realized_pnl: position.realized_pnl - realized_before,
            position_after: position.quantity,
        });
        Ok(())
    }

    fn on_metrics(&mut self, metrics: &MetricsEvent) -> Result<(), ReporterError> {
        let peak = self.peak_equity.get_or_insert(metrics.equity);
        if metrics.equity > *peak {
            *peak = metrics.equity;
        } else if *peak > Decimal::ZERO {
            let drawdown = (*peak - metrics.equity) / *peak;
            if drawdown > self.max_drawdown {
                self.max_drawdown = drawdown;
            }
        }
        Ok(())
    }

    fn on_finish(&mut self) -> Result<(), ReporterError> {
        let Some(path) = &self.sink else {
            return Ok(());
        };
        let summary = serde_json::json!({
            "trades": self.trades,
            "max_drawdown": self.max_drawdown,
        });
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, &summary)?;
        writer.flush()?;
        Ok(())
    }
}

/// Appends every fill to a durable JSON Lines file.
///
/// Line format: run id, ISO-8601 timestamp, symbol, side, quantity, price,
/// commission, realized PnL on close.
pub struct TradeLogReporter {
    run_id: String,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    positions: BTreeMap<String, Position>,
}

impl TradeLogReporter {
    pub fn new(run_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            run_id: run_id.into(),
            path: path.into(),
            writer: None,
            positions: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct TradeLogLine<'a> {
    run_id: &'a str,
    ts: String,
    symbol: &'a str,
    side: &'a str,
    quantity: i64,
    price: Decimal,
    commission: Decimal,
    realized_pnl: Decimal,
}

impl Reporter for TradeLogReporter {
    fn on_start(&mut self) -> Result<(), ReporterError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn on_fill(&mut self, fill: &FillEvent) -> Result<(), ReporterError> {
        let position = self.positions.entry(fill.symbol.clone()).or_default();
        let realized_before = position.realized_pnl;
        position.apply_fill(fill.side, fill.quantity, fill.fill_price);

        let line = TradeLogLine {
            run_id: &self.run_id,
            ts: fill.timestamp.to_rfc3339(),
            symbol: &fill.symbol,
            side: fill.side.as_str(),
            quantity: fill.quantity,
            price: fill.fill_price,
            commission: fill.commission,
            realized_pnl: position.realized_pnl - realized_before,
        };
        if let Some(writer) = self.writer.as_mut() {
            serde_json::to_writer(&mut *writer, &line)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        Ok(())
    }

    fn on_finish(&mut self) -> Result<(), ReporterError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use model::OrderSide;
    use rust_decimal_macros::dec;

    fn fill(side: OrderSide, quantity: i64, price: Decimal) -> FillEvent {
        FillEvent {
            order_id: "ord-1".into(),
            symbol: "SPY".into(),
            side,
            quantity,
            fill_price: price,
            commission: dec!(1),
            slippage: dec!(0),
            remaining: 0,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        }
    }

    fn metrics(equity: Decimal) -> MetricsEvent {
        MetricsEvent {
            equity,
            cash: equity,
            realized_pnl: dec!(0),
            unrealized_pnl: dec!(0),
            holdings: BTreeMap::new(),
        }
    }

    #[test]
    fn detailed_reporter_tracks_realized_pnl_and_drawdown() {
        let mut reporter = DetailedReporter::new(None);
        reporter.on_fill(&fill(OrderSide::Buy, 100, dec!(100))).unwrap();
        reporter.on_fill(&fill(OrderSide::Sell, 100, dec!(110))).unwrap();

        assert_eq!(reporter.trades().len(), 2);
        assert_eq!(reporter.trades()[0].realized_pnl, dec!(0));
        assert_eq!(reporter.trades()[1].realized_pnl, dec!(1000));
        assert_eq!(reporter.trades()[1].position_after, 0);

        reporter.on_metrics(&metrics(dec!(100_000))).unwrap();
        reporter.on_metrics(&metrics(dec!(110_000))).unwrap();
        reporter.on_metrics(&metrics(dec!(99_000))).unwrap();
        assert_eq!(reporter.max_drawdown(), dec!(0.1));
    }

    #[test]
    fn trade_log_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.jsonl");
        let mut reporter = TradeLogReporter::new("run-1", &path);
        reporter.on_start().unwrap();
        reporter.on_fill(&fill(OrderSide::Buy, 100, dec!(100))).unwrap();
        reporter.on_fill(&fill(OrderSide::Sell, 100, dec!(105))).unwrap();
        reporter.on_finish().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let last: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(last["run_id"], "run-1");
        assert_eq!(last["side"], "sell");
        assert_eq!(last["realized_pnl"], "500");
    }

    #[test]
    fn equity_curve_collects_points() {
        let mut reporter = EquityCurveReporter::new(None);
        let bar = Bar {
            symbol: "SPY".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            open: dec!(1),
            high: dec!(1),
            low: dec!(1),
            close: dec!(1),
            volume: dec!(0),
            amount: dec!(0),
        };
        reporter.on_market(&bar).unwrap();
        reporter.on_metrics(&metrics(dec!(100_000))).unwrap();
        assert_eq!(reporter.curve().len(), 1);
        assert_eq!(reporter.curve()[0].1, dec!(100_000));
    }
}
