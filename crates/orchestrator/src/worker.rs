//! The run worker: assemble an engine from a config document and drive it,
//! forwarding every pipeline event upstream as framed records.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{error, info};

use engine_core::{
    BreakoutStrategy, BuyingPowerRule, CancelToken, ConcentrationRule, CsvBarFeed,
    DetailedReporter, Engine, EngineConfig, EngineError, EquityCurveReporter, ExecutionConfig,
    FillTiming, InMemoryFeed, MaxPositionRule, MovingAverageStrategy, PortfolioConfig,
    PriceBandRule, SizingRule, SlippageModel, TradeLogReporter, WeightAllocator,
};
use feed_live::{spawn_polling_feed, spawn_push_feed, PollingFeedConfig, PushFeedConfig};
use model::{EventRecord, RunStatus, TimeInForce};

use crate::config::{
    FeedConfig, FillTimingConfig, Registry, ReporterSection, RiskSection, RunConfig, SizingMode,
    SlippageConfig, StrategyConfig, ValidationMode,
};
use crate::error::ConfigError;
use crate::ipc::{
    WorkerRecord, EXIT_CANCELED, EXIT_CONFIG_INVALID, EXIT_FEED_ERROR, EXIT_INTERNAL, EXIT_OK,
};

/// Where a worker pushes its framed records. Must be callable from the
/// engine thread.
pub type RecordSink = Arc<dyn Fn(WorkerRecord) + Send + Sync>;

/// Assemble an engine for `config`.
///
/// Live feed types need a tokio runtime handle for their producer tasks;
/// historical feeds do not.
#[allow(clippy::too_many_arguments)]
pub fn build_engine(
    registry: &Registry,
    run_id: &str,
    config: &RunConfig,
    cancel: CancelToken,
    runtime: Option<&Handle>,
    progress: Box<dyn FnMut(f64)>,
    tap: Box<dyn FnMut(&EventRecord)>,
) -> Result<Engine, ConfigError> {
    let mut builder = Engine::builder(EngineConfig {
        run_id: run_id.to_string(),
        name: config.name.clone(),
        strike_budget: 25,
    })
    .cancel_token(cancel)
    .on_progress(progress)
    .event_tap(tap);

    builder = builder.feed(build_feed(registry, &config.data_feed, runtime)?);

    for strategy in &config.strategies {
        builder = builder.strategy(build_strategy(registry, strategy)?);
    }

    let portfolio = &config.portfolio;
    let sizing = match portfolio.sizing {
        SizingMode::FixedLot => SizingRule::FixedLot {
            lot_size: portfolio.lot_size,
        },
        SizingMode::TargetWeight => SizingRule::TargetWeight {
            allocator: WeightAllocator {
                max_leverage: portfolio.max_leverage,
                lot_size: portfolio.lot_size,
            },
        },
    };
    builder = builder.portfolio(PortfolioConfig {
        initial_cash: portfolio.initial_cash,
        sizing,
        allow_short: portfolio.allow_short,
        default_tif: TimeInForce::Gtc,
    });

    for rule in &config.risk {
        builder = builder.risk_rule(match rule {
            RiskSection::MaxPosition { limit } => Box::new(MaxPositionRule { limit: *limit }),
            RiskSection::BuyingPower { fee_rate } => {
                Box::new(BuyingPowerRule { fee_rate: *fee_rate })
            }
            RiskSection::Concentration { max_fraction } => Box::new(ConcentrationRule {
                max_fraction: *max_fraction,
            }),
            RiskSection::PriceBand { band } => Box::new(PriceBandRule { band: *band }),
        });
    }

    let execution = &config.execution;
    builder = builder.execution(ExecutionConfig {
        fill_timing: match execution.fill_timing {
            FillTimingConfig::CurrentClose => FillTiming::CurrentClose,
            FillTimingConfig::NextOpen => FillTiming::NextOpen,
        },
        slippage: match execution.slippage {
            SlippageConfig::None => SlippageModel::None,
            SlippageConfig::Relative { value } => SlippageModel::Relative(value),
            SlippageConfig::Absolute { value } => SlippageModel::Absolute(value),
            SlippageConfig::BasisPoints { value } => SlippageModel::BasisPoints(value),
        },
        commission_per_share: execution.commission_per_share,
        commission_rate: execution.commission_rate,
        volume_cap: execution.volume_cap,
        staleness_threshold: execution
            .staleness_threshold_secs
            .map(chrono::Duration::seconds),
    });

    for reporter in &config.reporters {
        builder = builder.reporter(match reporter {
            ReporterSection::Equity { path } => Box::new(EquityCurveReporter::new(
                path.as_ref().map(PathBuf::from),
            )),
            ReporterSection::Detailed { path } => {
                Box::new(DetailedReporter::new(path.as_ref().map(PathBuf::from)))
            }
            ReporterSection::Tradelog { path } => {
                Box::new(TradeLogReporter::new(run_id, path.clone()))
            }
        });
    }

    builder.build().map_err(|err| ConfigError::Section {
        section: "engine",
        reason: err.to_string(),
    })
}

fn build_feed(
    registry: &Registry,
    feed: &FeedConfig,
    runtime: Option<&Handle>,
) -> Result<Box<dyn engine_core::DataFeed>, ConfigError> {
    let need_runtime = || {
        runtime.ok_or(ConfigError::Section {
            section: "data_feed",
            reason: "live feeds require an async runtime".to_string(),
        })
    };
    Ok(match feed {
        FeedConfig::Inmemory { bars } => Box::new(InMemoryFeed::new(bars.clone())),
        FeedConfig::LocalCsv { path, symbol, start, end }
        | FeedConfig::LocalFile { path, symbol, start, end } => Box::new(
            CsvBarFeed::load(path, symbol, *start, *end).map_err(|err| ConfigError::Section {
                section: "data_feed",
                reason: err.to_string(),
            })?,
        ),
        FeedConfig::Rest {
            symbol,
            url,
            poll_interval_secs,
            max_ticks,
            heartbeat_secs,
        } => Box::new(spawn_polling_feed(
            PollingFeedConfig {
                symbol: symbol.clone(),
                url: url.clone(),
                poll_interval: Duration::from_secs_f64(*poll_interval_secs),
                max_ticks: *max_ticks,
                heartbeat: Duration::from_secs(*heartbeat_secs),
                ..PollingFeedConfig::default()
            },
            need_runtime()?,
        )),
        FeedConfig::LiveApi {
            symbol,
            url,
            token,
            poll_interval_secs,
            heartbeat_secs,
        } => Box::new(spawn_polling_feed(
            PollingFeedConfig {
                symbol: symbol.clone(),
                url: url.clone(),
                poll_interval: Duration::from_secs_f64(*poll_interval_secs),
                heartbeat: Duration::from_secs(*heartbeat_secs),
                bearer_token: token.clone(),
                ..PollingFeedConfig::default()
            },
            need_runtime()?,
        )),
        FeedConfig::Websocket {
            symbol,
            url,
            max_reconnects,
            heartbeat_secs,
        }
        | FeedConfig::PushStream {
            symbol,
            url,
            max_reconnects,
            heartbeat_secs,
        } => Box::new(spawn_push_feed(
            PushFeedConfig {
                symbol: symbol.clone(),
                url: url.clone(),
                max_reconnects: *max_reconnects,
                heartbeat: Duration::from_secs(*heartbeat_secs),
                ..PushFeedConfig::default()
            },
            need_runtime()?,
        )),
        FeedConfig::Plugin { name, params } => {
            let ctor = registry.feed(name).ok_or_else(|| ConfigError::UnknownComponent {
                category: "data_feed",
                name: name.clone(),
            })?;
            ctor(params)?
        }
    })
}

fn build_strategy(
    registry: &Registry,
    strategy: &StrategyConfig,
) -> Result<Box<dyn engine_core::Strategy>, ConfigError> {
    Ok(match strategy {
        StrategyConfig::MovingAverage {
            id,
            symbol,
            short_window,
            long_window,
            allow_short,
        } => {
            let id = id.clone().unwrap_or_else(|| format!("ma-{symbol}"));
            Box::new(
                MovingAverageStrategy::new(id, symbol, *short_window, *long_window, *allow_short)
                    .map_err(|err| ConfigError::Section {
                        section: "strategies",
                        reason: err.to_string(),
                    })?,
            )
        }
        StrategyConfig::Breakout {
            id,
            symbol,
            lookback,
            allow_short,
        } => {
            let id = id.clone().unwrap_or_else(|| format!("breakout-{symbol}"));
            Box::new(
                BreakoutStrategy::new(id, symbol, *lookback, *allow_short).map_err(|err| {
                    ConfigError::Section {
                        section: "strategies",
                        reason: err.to_string(),
                    }
                })?,
            )
        }
        StrategyConfig::Plugin { name, params } => {
            let ctor = registry
                .strategy(name)
                .ok_or_else(|| ConfigError::UnknownComponent {
                    category: "strategy",
                    name: name.clone(),
                })?;
            ctor(params)?
        }
    })
}

/// Run one engine to completion, emitting records into `sink`. Returns the
/// process exit code.
pub fn execute_run(
    registry: &Registry,
    run_id: &str,
    config_value: &serde_json::Value,
    mode: ValidationMode,
    cancel: CancelToken,
    runtime: Option<&Handle>,
    sink: RecordSink,
) -> i32 {
    let fail = |sink: &RecordSink, error: String, code: i32| {
        sink(WorkerRecord::Terminal {
            status: if code == EXIT_CANCELED {
                RunStatus::Canceled
            } else {
                RunStatus::Failed
            },
            error: Some(error),
            summary: None,
        });
        code
    };

    let config = match RunConfig::parse(config_value, mode) {
        Ok(config) => config,
        Err(err) => return fail(&sink, format!("config_invalid: {err}"), EXIT_CONFIG_INVALID),
    };

    let progress_sink = sink.clone();
    let mut last_reported = -1.0_f64;
    let progress = Box::new(move |fraction: f64| {
        // Throttle to whole-percent steps so the IPC stream stays light.
        if fraction - last_reported >= 0.01 || fraction >= 1.0 {
            last_reported = fraction;
            progress_sink(WorkerRecord::Progress { fraction });
        }
    });

    let tap_sink = sink.clone();
    let tap = Box::new(move |record: &EventRecord| {
        tap_sink(WorkerRecord::Event {
            record: record.clone(),
        })
    });

    let mut engine = match build_engine(registry, run_id, &config, cancel, runtime, progress, tap) {
        Ok(engine) => engine,
        Err(err) => return fail(&sink, format!("config_invalid: {err}"), EXIT_CONFIG_INVALID),
    };

    match engine.run() {
        Ok(summary) => {
            let status = if summary.canceled {
                RunStatus::Canceled
            } else {
                RunStatus::Succeeded
            };
            let code = if summary.canceled { EXIT_CANCELED } else { EXIT_OK };
            sink(WorkerRecord::Terminal {
                status,
                error: None,
                summary: Some(summary),
            });
            code
        }
        Err(err @ EngineError::Feed(_)) => {
            error!(run_id, error = %err, "run failed on feed");
            fail(&sink, format!("feed_error: {err}"), EXIT_FEED_ERROR)
        }
        Err(err) => {
            error!(run_id, error = %err, "run failed");
            fail(&sink, format!("internal_error: {err}"), EXIT_INTERNAL)
        }
    }
}

/// Process entry point for `worker` mode.
///
/// Protocol: the parent writes the config document as the first stdin
/// line, then optionally `cancel`. Every framed record goes to stdout as
/// one JSON line; the write blocks when the parent is congested, which is
/// the back-pressure path all the way into the engine's feed step.
pub fn worker_main(registry: &Registry, run_id: &str) -> i32 {
    let mut reader = BufReader::new(std::io::stdin());
    let mut first_line = String::new();
    if reader.read_line(&mut first_line).is_err() || first_line.trim().is_empty() {
        eprintln!("worker: missing config document on stdin");
        return EXIT_CONFIG_INVALID;
    }
    let config_value: serde_json::Value = match serde_json::from_str(first_line.trim()) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("worker: config is not valid JSON: {err}");
            return EXIT_CONFIG_INVALID;
        }
    };

    let cancel = CancelToken::new();
    let watcher_cancel = cancel.clone();
    std::thread::spawn(move || {
        for line in reader.lines() {
            match line {
                Ok(line) if line.trim() == "cancel" => {
                    info!("cancel requested by controller");
                    watcher_cancel.cancel();
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("worker: failed to start runtime: {err}");
            return EXIT_INTERNAL;
        }
    };

    let sink: RecordSink = Arc::new(|record: WorkerRecord| {
        if let Ok(line) = record.encode() {
            let stdout = std::io::stdout();
            let mut guard = stdout.lock();
            // Errors mean the parent is gone; nothing useful left to do.
            let _ = writeln!(guard, "{line}");
            let _ = guard.flush();
        }
    });

    execute_run(
        registry,
        run_id,
        &config_value,
        // The controller validated at submit; workers stay permissive so a
        // newer controller can hand them extended documents.
        ValidationMode::Forward,
        cancel,
        Some(runtime.handle()),
        sink,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn sink_into(records: Arc<Mutex<Vec<WorkerRecord>>>) -> RecordSink {
        Arc::new(move |record| records.lock().push(record))
    }

    fn bars_config() -> serde_json::Value {
        let bars: Vec<serde_json::Value> = (0..20)
            .map(|index| {
                let price = format!("{}", 100.0 + 0.5 * index as f64);
                json!({
                    "symbol": "SPY",
                    "timestamp": format!("2024-01-{:02}T00:00:00Z", index + 1),
                    "open": price,
                    "high": price,
                    "low": price,
                    "close": price,
                    "volume": "1000000",
                })
            })
            .collect();
        json!({
            "name": "worker-test",
            "data_feed": {"type": "inmemory", "bars": bars},
            "strategies": [
                {"type": "moving_average", "symbol": "SPY", "short_window": 2, "long_window": 4},
            ],
        })
    }

    #[test]
    fn execute_run_succeeds_and_streams_records() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let code = execute_run(
            &Registry::new(),
            "run-1",
            &bars_config(),
            ValidationMode::Strict,
            CancelToken::new(),
            None,
            sink_into(records.clone()),
        );
        assert_eq!(code, EXIT_OK);

        let records = records.lock();
        assert!(records.iter().any(|r| matches!(r, WorkerRecord::Event { .. })));
        assert!(records.iter().any(|r| matches!(r, WorkerRecord::Progress { .. })));
        let last = records.last().unwrap();
        match last {
            WorkerRecord::Terminal { status, summary, .. } => {
                assert_eq!(*status, RunStatus::Succeeded);
                assert_eq!(summary.as_ref().unwrap().bars, 20);
            }
            other => panic!("expected terminal record, got {other:?}"),
        }
    }

    #[test]
    fn invalid_config_exits_without_engine() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let code = execute_run(
            &Registry::new(),
            "run-1",
            &json!({"name": "x"}),
            ValidationMode::Forward,
            CancelToken::new(),
            None,
            sink_into(records.clone()),
        );
        assert_eq!(code, EXIT_CONFIG_INVALID);
        let records = records.lock();
        assert_eq!(records.len(), 1);
        assert!(matches!(
            &records[0],
            WorkerRecord::Terminal { status: RunStatus::Failed, error: Some(err), .. }
            if err.starts_with("config_invalid")
        ));
    }

    #[test]
    fn canceled_run_reports_canceled() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let records = Arc::new(Mutex::new(Vec::new()));
        let code = execute_run(
            &Registry::new(),
            "run-1",
            &bars_config(),
            ValidationMode::Forward,
            cancel,
            None,
            sink_into(records.clone()),
        );
        assert_eq!(code, EXIT_CANCELED);
        assert!(matches!(
            records.lock().last().unwrap(),
            WorkerRecord::Terminal { status: RunStatus::Canceled, .. }
        ));
    }
}
