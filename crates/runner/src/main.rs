//! btrun - backtest runtime.
//!
//! This is the main entry point for the runtime. It:
//! - Runs the controller (`serve`): run store, admission-bounded run
//!   manager, outbox dispatchers, lease recovery
//! - Runs one isolated run worker (`worker`, spawned by the controller)
//! - Runs a one-shot local backtest from a config document (`backtest`)
//!
//! # Usage
//!
//! ```bash
//! # Controller with two submitted runs
//! btrun serve --data-dir ./data --max-runs 4 \
//!     --submit configs/ma.json --submit configs/breakout.json
//!
//! # One-shot local backtest
//! btrun backtest --config configs/ma.json
//! ```

mod notify;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use engine_core::CancelToken;
use orchestrator::{
    worker, ManagerConfig, ProcessLauncher, Registry, RunManager, RunStore, ValidationMode,
    WorkerRecord, EXIT_CONFIG_INVALID, EXIT_INTERNAL,
};
use outbox::{Dispatcher, DispatcherConfig, Outbox, RetryPolicy};

use notify::{ConfigWebhookAdapter, NotifySink};

/// Interval between lease-recovery sweeps.
const LEASE_RECOVERY_INTERVAL: Duration = Duration::from_secs(30);

fn print_usage() {
    eprintln!("Usage: btrun <COMMAND> [OPTIONS]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  serve       Run the controller");
    eprintln!("  backtest    Run one backtest locally and print its summary");
    eprintln!("  worker      Run one engine worker (spawned by the controller)");
    eprintln!();
    eprintln!("serve options:");
    eprintln!("  --data-dir <DIR>      State directory (default: ./data)");
    eprintln!("  --max-runs <N>        Concurrent run bound (default: 4)");
    eprintln!("  --dispatchers <N>     Outbox dispatcher workers (default: 2)");
    eprintln!("  --submit <FILE>       Submit a config document at startup (repeatable)");
    eprintln!("  --strict              Reject unknown config keys");
    eprintln!();
    eprintln!("backtest options:");
    eprintln!("  --config <FILE>       Config document (required)");
    eprintln!("  --strict              Reject unknown config keys");
    eprintln!();
    eprintln!("worker options:");
    eprintln!("  --run-id <ID>         Run identifier (required)");
}

fn main() {
    // Load .env if present, before logging so RUST_LOG applies.
    match dotenvy::dotenv() {
        Ok(path) => eprintln!("Loaded environment from: {}", path.display()),
        Err(dotenvy::Error::Io(_)) => {}
        Err(err) => eprintln!("Warning: failed to load .env file: {err}"),
    }
    common::init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = match args.first().map(String::as_str) {
        Some("worker") => worker_mode(&args[1..]),
        Some("serve") => block_on(serve(args[1..].to_vec())),
        Some("backtest") => block_on(backtest(args[1..].to_vec())),
        Some("--help") | Some("-h") => {
            print_usage();
            0
        }
        Some(other) => {
            eprintln!("Unknown command: {other}");
            print_usage();
            1
        }
        None => {
            print_usage();
            1
        }
    };
    std::process::exit(code);
}

fn block_on<F: std::future::Future<Output = i32>>(future: F) -> i32 {
    match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime.block_on(future),
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            EXIT_INTERNAL
        }
    }
}

/// Build the component registry. An embedding program registers plugin
/// strategies and feeds here before anything is submitted.
fn build_registry() -> Registry {
    Registry::new()
}

fn worker_mode(args: &[String]) -> i32 {
    let mut run_id = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--run-id" => run_id = iter.next().cloned(),
            other => {
                eprintln!("worker: unknown option {other}");
                return EXIT_CONFIG_INVALID;
            }
        }
    }
    let Some(run_id) = run_id else {
        eprintln!("worker: --run-id is required");
        return EXIT_CONFIG_INVALID;
    };
    let registry = build_registry();
    worker::worker_main(&registry, &run_id)
}

struct ServeOptions {
    data_dir: PathBuf,
    max_runs: usize,
    dispatchers: usize,
    submit: Vec<PathBuf>,
    validation: ValidationMode,
}

fn parse_serve_options(args: &[String]) -> Result<ServeOptions, String> {
    let mut options = ServeOptions {
        data_dir: PathBuf::from("./data"),
        max_runs: 4,
        dispatchers: 2,
        submit: Vec::new(),
        validation: ValidationMode::Forward,
    };
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--data-dir" => {
                options.data_dir = iter
                    .next()
                    .map(PathBuf::from)
                    .ok_or("--data-dir needs a value")?;
            }
            "--max-runs" => {
                options.max_runs = iter
                    .next()
                    .and_then(|value| value.parse().ok())
                    .ok_or("--max-runs needs a number")?;
            }
            "--dispatchers" => {
                options.dispatchers = iter
                    .next()
                    .and_then(|value| value.parse().ok())
                    .ok_or("--dispatchers needs a number")?;
            }
            "--submit" => {
                options
                    .submit
                    .push(iter.next().map(PathBuf::from).ok_or("--submit needs a file")?);
            }
            "--strict" => options.validation = ValidationMode::Strict,
            other => return Err(format!("unknown option: {other}")),
        }
    }
    Ok(options)
}

async fn serve(args: Vec<String>) -> i32 {
    let options = match parse_serve_options(&args) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("serve: {err}");
            print_usage();
            return EXIT_CONFIG_INVALID;
        }
    };
    if let Err(err) = std::fs::create_dir_all(&options.data_dir) {
        error!(error = %err, "cannot create data directory");
        return EXIT_INTERNAL;
    }

    // Durable state: runs + events in one store, the outbox in another.
    let store = match RunStore::connect(&options.data_dir.join("runs.db")).await {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, "run store unavailable");
            return EXIT_INTERNAL;
        }
    };
    match store.recover_incomplete().await {
        Ok(0) => {}
        Ok(recovered) => warn!(recovered, "previous controller left live runs"),
        Err(err) => {
            error!(error = %err, "run store recovery failed");
            return EXIT_INTERNAL;
        }
    }
    let outbox = match Outbox::connect(&options.data_dir.join("outbox.db"), RetryPolicy::default())
        .await
    {
        Ok(outbox) => outbox,
        Err(err) => {
            error!(error = %err, "outbox unavailable");
            return EXIT_INTERNAL;
        }
    };

    let launcher = match ProcessLauncher::current_exe() {
        Ok(launcher) => Arc::new(launcher),
        Err(err) => {
            error!(error = %err, "cannot resolve worker executable");
            return EXIT_INTERNAL;
        }
    };
    let sink = Arc::new(NotifySink::new(store.clone(), outbox.clone()));
    let manager = RunManager::new(
        store.clone(),
        launcher,
        ManagerConfig {
            max_concurrent_runs: options.max_runs,
            ..ManagerConfig::default()
        },
        vec![sink],
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    for index in 0..options.dispatchers.max(1) {
        let adapter = match ConfigWebhookAdapter::new(store.clone(), Duration::from_secs(10)) {
            Ok(adapter) => Arc::new(adapter),
            Err(err) => {
                error!(error = %err, "webhook adapter unavailable");
                return EXIT_INTERNAL;
            }
        };
        let dispatcher = Dispatcher::new(outbox.clone(), DispatcherConfig::default())
            .with_fallback_adapter(adapter);
        info!(index, "starting dispatcher");
        tasks.push(tokio::spawn(dispatcher.run(shutdown_rx.clone())));
    }
    tasks.push(tokio::spawn(outbox::run_lease_recovery(
        outbox.clone(),
        LEASE_RECOVERY_INTERVAL,
        shutdown_rx.clone(),
    )));

    for path in &options.submit {
        match std::fs::read_to_string(path)
            .map_err(|err| err.to_string())
            .and_then(|raw| serde_json::from_str(&raw).map_err(|err| err.to_string()))
        {
            Ok(config) => match manager.submit(config, options.validation).await {
                Ok(run_id) => info!(run_id = %run_id, path = %path.display(), "submitted"),
                Err(err) => error!(path = %path.display(), error = %err, "submit failed"),
            },
            Err(err) => error!(path = %path.display(), error = %err, "unreadable config"),
        }
    }

    info!(
        data_dir = %options.data_dir.display(),
        max_runs = options.max_runs,
        "controller up; press Ctrl+C to stop"
    );
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    0
}

async fn backtest(args: Vec<String>) -> i32 {
    let mut config_path = None;
    let mut validation = ValidationMode::Forward;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => config_path = iter.next().map(PathBuf::from),
            "--strict" => validation = ValidationMode::Strict,
            other => {
                eprintln!("backtest: unknown option {other}");
                return EXIT_CONFIG_INVALID;
            }
        }
    }
    let Some(config_path) = config_path else {
        eprintln!("backtest: --config is required");
        print_usage();
        return EXIT_CONFIG_INVALID;
    };

    let config: serde_json::Value = match std::fs::read_to_string(&config_path)
        .map_err(|err| err.to_string())
        .and_then(|raw| serde_json::from_str(&raw).map_err(|err| err.to_string()))
    {
        Ok(value) => value,
        Err(err) => {
            eprintln!("backtest: cannot read {}: {err}", config_path.display());
            return EXIT_CONFIG_INVALID;
        }
    };

    let cancel = CancelToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancel requested");
            ctrl_c_cancel.cancel();
        }
    });

    let registry = build_registry();
    let handle = tokio::runtime::Handle::current();
    let run_id = format!("local-{}", chrono::Utc::now().timestamp());
    tokio::task::spawn_blocking(move || {
        let sink: worker::RecordSink = Arc::new(|record: WorkerRecord| match record {
            WorkerRecord::Terminal {
                status,
                error,
                summary,
            } => {
                if let Some(summary) = summary {
                    match serde_json::to_string_pretty(&summary) {
                        Ok(rendered) => println!("{rendered}"),
                        Err(err) => warn!(error = %err, "summary not serializable"),
                    }
                }
                match error {
                    Some(error) => error!(status = %status, %error, "backtest finished"),
                    None => info!(status = %status, "backtest finished"),
                }
            }
            WorkerRecord::Progress { fraction } => {
                tracing::debug!(fraction, "progress");
            }
            _ => {}
        });
        worker::execute_run(
            &registry,
            &run_id,
            &config,
            validation,
            cancel,
            Some(&handle),
            sink,
        )
    })
    .await
    .unwrap_or(EXIT_INTERNAL)
}
