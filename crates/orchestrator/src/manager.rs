//! Run admission, worker launch, relay, and cancellation.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use engine_core::CancelToken;
use model::{EventRecord, Run, RunStatus};

use crate::config::{Registry, RunConfig, ValidationMode};
use crate::error::OrchestratorError;
use crate::fanout::{FanOut, StreamItem};
use crate::ipc::{status_for_exit_code, WorkerRecord};
use crate::store::RunStore;
use crate::worker::{self, RecordSink};

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_concurrent_runs: usize,
    /// FIFO admission queue bound; overflow fails the submit.
    pub queue_capacity: usize,
    /// Recent events replayed to late subscribers.
    pub ring_capacity: usize,
    pub subscriber_buffer: usize,
    /// Grace a subscriber gets before being dropped.
    pub send_deadline: Duration,
    /// Grace a canceled worker gets before being killed.
    pub cancel_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 4,
            queue_capacity: 16,
            ring_capacity: 256,
            subscriber_buffer: 64,
            send_deadline: Duration::from_millis(250),
            cancel_grace: Duration::from_secs(30),
        }
    }
}

/// A launched worker as seen by the manager.
pub struct WorkerHandle {
    /// Totally ordered record stream; closing it means the worker is gone.
    pub records: mpsc::Receiver<WorkerRecord>,
    /// Deliver the cooperative cancel signal.
    pub canceler: Box<dyn Fn() + Send + Sync>,
    /// Forcibly terminate the worker (None when not applicable).
    pub killer: Option<Box<dyn FnOnce() + Send>>,
}

/// Isolation seam: how a run worker is brought to life.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(
        &self,
        run_id: &str,
        config: serde_json::Value,
    ) -> Result<WorkerHandle, OrchestratorError>;
}

/// Observer of every relayed pipeline event (the notification bridge hooks
/// in here).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_event(&self, record: &EventRecord);
}

struct ActiveRun {
    canceler: Box<dyn Fn() + Send + Sync>,
    killer: parking_lot::Mutex<Option<Box<dyn FnOnce() + Send>>>,
    fanout: Arc<FanOut>,
    cancel_requested: AtomicBool,
}

struct Inner {
    store: RunStore,
    launcher: Arc<dyn Launcher>,
    config: ManagerConfig,
    active: DashMap<String, Arc<ActiveRun>>,
    queue: parking_lot::Mutex<VecDeque<String>>,
    sinks: Vec<Arc<dyn EventSink>>,
}

/// Admits runs under a concurrency bound, launches workers, relays their
/// records into the store and per-run fan-out.
#[derive(Clone)]
pub struct RunManager {
    inner: Arc<Inner>,
}

impl RunManager {
    pub fn new(
        store: RunStore,
        launcher: Arc<dyn Launcher>,
        config: ManagerConfig,
        sinks: Vec<Arc<dyn EventSink>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                launcher,
                config,
                active: DashMap::new(),
                queue: parking_lot::Mutex::new(VecDeque::new()),
                sinks,
            }),
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.inner.store
    }

    /// Validate, persist, and admit a run. Returns its id.
    ///
    /// At capacity the run waits in the FIFO queue; queue overflow fails
    /// with `ResourceExhausted` and nothing is persisted.
    pub async fn submit(
        &self,
        config: serde_json::Value,
        mode: ValidationMode,
    ) -> Result<String, OrchestratorError> {
        let parsed = RunConfig::parse(&config, mode)?;

        let start_now = {
            let queue = self.inner.queue.lock();
            let slots_free = self.inner.active.len() < self.inner.config.max_concurrent_runs;
            if slots_free && queue.is_empty() {
                true
            } else if queue.len() < self.inner.config.queue_capacity {
                false
            } else {
                return Err(OrchestratorError::ResourceExhausted {
                    queued: queue.len(),
                    cap: self.inner.config.queue_capacity,
                });
            }
        };

        let run = self.inner.store.create(&parsed.name, &config).await?;
        info!(run_id = %run.id, name = %parsed.name, start_now, "run submitted");
        if start_now {
            self.start(&run.id).await?;
        } else {
            self.inner.queue.lock().push_back(run.id.clone());
        }
        Ok(run.id)
    }


    /// Launch the worker for a pending run and spawn its relay.
    ///
    /// Boxed explicitly (rather than `async fn`) because this method and
    /// `start_next` call each other indirectly (`start` spawns a task that
    /// calls `relay`, which calls `start_next`, which calls `start`); an
    /// `async fn` here would give `start` a self-referential opaque
    /// return type that the compiler cannot prove `Send` for.
    fn start<'a>(
        &'a self,
        run_id: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), OrchestratorError>> + Send + 'a>>
    {
        Box::pin(async move {
            let run = self
                .inner
                .store
                .get(run_id)
                .await?
                .ok_or_else(|| OrchestratorError::UnknownRun(run_id.to_string()))?;
            self.inner
                .store
                .transition(run_id, RunStatus::Running, None)
                .await?;

            let handle = match self.inner.launcher.launch(run_id, run.config).await {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(run_id, error = %err, "worker launch failed");
                    self.inner
                        .store
                        .transition(run_id, RunStatus::Failed, Some(&err.to_string()))
                        .await?;
                    return Err(err);
                }
            };

            let active = Arc::new(ActiveRun {
                canceler: handle.canceler,
                killer: parking_lot::Mutex::new(handle.killer),
                fanout: Arc::new(FanOut::new(
                    self.inner.config.ring_capacity,
                    self.inner.config.subscriber_buffer,
                    self.inner.config.send_deadline,
                )),
                cancel_requested: AtomicBool::new(false),
            });
            self.inner
                .active
                .insert(run_id.to_string(), active.clone());

            let manager = self.clone();
            let run_id = run_id.to_string();
            tokio::spawn(async move {
                manager.relay(run_id, handle.records, active).await;
            });
            Ok(())
        })
    }

    /// Read the worker's records to the end, mirroring them into the store,
    /// the fan-out, and the event sinks; then finalize the run and admit
    /// the next queued one.
    async fn relay(
        &self,
        run_id: String,
        mut records: mpsc::Receiver<WorkerRecord>,
        active: Arc<ActiveRun>,
    ) {
        let mut terminal: Option<(RunStatus, Option<String>)> = None;
        while let Some(record) = records.recv().await {
            match record {
                WorkerRecord::Event { record } => {
                    if let Err(err) = self.inner.store.append_event(&run_id, &record).await {
                        warn!(run_id = %run_id, error = %err, "event append failed");
                    }
                    for sink in &self.inner.sinks {
                        sink.on_event(&record).await;
                    }
                    active.fanout.publish(StreamItem::Event(record)).await;
                }
                WorkerRecord::Progress { fraction } => {
                    if let Err(err) = self.inner.store.set_progress(&run_id, fraction).await {
                        warn!(run_id = %run_id, error = %err, "progress update failed");
                    }
                    active.fanout.publish(StreamItem::Progress { fraction }).await;
                }
                WorkerRecord::Log { level, message } => {
                    info!(run_id = %run_id, worker_level = %level, "{message}");
                }
                WorkerRecord::Terminal { status, error, .. } => {
                    // Nothing follows a terminal record by contract.
                    terminal = Some((status, error));
                    break;
                }
            }
        }

        let (status, error) = terminal.unwrap_or_else(|| {
            if active.cancel_requested.load(Ordering::SeqCst) {
                (
                    RunStatus::Canceled,
                    Some("worker terminated during cancel grace period".to_string()),
                )
            } else {
                (
                    RunStatus::Failed,
                    Some("worker stream ended without a terminal record".to_string()),
                )
            }
        });
        if let Err(err) = self
            .inner
            .store
            .transition(&run_id, status, error.as_deref())
            .await
        {
            warn!(run_id = %run_id, error = %err, "terminal transition failed");
        }
        active.fanout.close(status).await;
        self.inner.active.remove(&run_id);
        info!(run_id = %run_id, status = %status, "run finished");

        self.start_next().await;
    }

    /// Admit queued runs while capacity allows.
    async fn start_next(&self) {
        loop {
            let next = {
                let mut queue = self.inner.queue.lock();
                if self.inner.active.len() < self.inner.config.max_concurrent_runs {
                    queue.pop_front()
                } else {
                    None
                }
            };
            let Some(run_id) = next else { break };
            match self.start(&run_id).await {
                Ok(()) => {}
                Err(err) => {
                    // Already marked failed; keep draining the queue.
                    warn!(run_id = %run_id, error = %err, "queued run failed to start");
                }
            }
        }
    }

    /// Cooperatively cancel a run; force-kill after the grace period.
    pub async fn cancel(&self, run_id: &str) -> Result<(), OrchestratorError> {
        // A queued run is simply withdrawn.
        let was_queued = {
            let mut queue = self.inner.queue.lock();
            match queue.iter().position(|id| id == run_id) {
                Some(position) => {
                    queue.remove(position);
                    true
                }
                None => false,
            }
        };
        if was_queued {
            self.inner
                .store
                .transition(run_id, RunStatus::Canceled, Some("canceled while queued"))
                .await?;
            return Ok(());
        }

        let Some(active) = self
            .inner
            .active
            .get(run_id)
            .map(|entry| entry.value().clone())
        else {
            let run = self
                .inner
                .store
                .get(run_id)
                .await?
                .ok_or_else(|| OrchestratorError::UnknownRun(run_id.to_string()))?;
            return Err(OrchestratorError::InvalidState {
                run_id: run_id.to_string(),
                status: run.status.to_string(),
            });
        };

        info!(run_id, "cancel requested");
        active.cancel_requested.store(true, Ordering::SeqCst);
        (active.canceler)();

        let manager = self.clone();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(manager.inner.config.cancel_grace).await;
            if let Some(active) = manager
                .inner
                .active
                .get(&run_id)
                .map(|entry| entry.value().clone())
            {
                warn!(run_id = %run_id, "cancel grace expired; force-killing worker");
                if let Some(kill) = active.killer.lock().take() {
                    kill();
                }
            }
        });
        Ok(())
    }

    /// Subscribe to a run's events: ring replay first, then live items
    /// until the run terminates.
    pub async fn stream(
        &self,
        run_id: &str,
    ) -> Result<mpsc::Receiver<StreamItem>, OrchestratorError> {
        if let Some(active) = self.inner.active.get(run_id) {
            return Ok(active.fanout.subscribe().await);
        }
        let run = self
            .inner
            .store
            .get(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownRun(run_id.to_string()))?;
        let events = self
            .inner
            .store
            .recent_events(run_id, self.inner.config.ring_capacity as u32)
            .await?;
        let (sender, receiver) = mpsc::channel(events.len() + 2);
        for event in events {
            let _ = sender.try_send(StreamItem::Event(event));
        }
        if run.status.is_terminal() {
            let _ = sender.try_send(StreamItem::Terminal { status: run.status });
        }
        Ok(receiver)
    }

    pub async fn get(&self, run_id: &str) -> Result<Run, OrchestratorError> {
        self.inner
            .store
            .get(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownRun(run_id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Run>, OrchestratorError> {
        self.inner.store.list().await
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

/// Launches workers as subprocesses of this executable, speaking JSON
/// Lines over stdio.
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    /// Re-invoke the current executable in `worker` mode.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
        })
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &self,
        run_id: &str,
        config: serde_json::Value,
    ) -> Result<WorkerHandle, OrchestratorError> {
        let mut child = Command::new(&self.program)
            .arg("worker")
            .arg("--run-id")
            .arg(run_id)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| OrchestratorError::Launch("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OrchestratorError::Launch("worker stdout unavailable".to_string()))?;

        // The config goes by value as the first stdin line.
        let mut line = serde_json::to_string(&config)?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;

        let stdin = Arc::new(tokio::sync::Mutex::new(stdin));
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (record_tx, record_rx) = mpsc::channel(256);
        tokio::spawn(read_worker_stdout(child, stdout, record_tx, kill_rx));

        let cancel_stdin = stdin.clone();
        let canceler = Box::new(move || {
            let stdin = cancel_stdin.clone();
            tokio::spawn(async move {
                let mut guard = stdin.lock().await;
                let _ = guard.write_all(b"cancel\n").await;
                let _ = guard.flush().await;
            });
        });
        let killer: Box<dyn FnOnce() + Send> = Box::new(move || {
            let _ = kill_tx.send(());
        });

        Ok(WorkerHandle {
            records: record_rx,
            canceler,
            killer: Some(killer),
        })
    }
}

/// Relay-side reader of the worker pipe. Awaiting `send` here is the
/// back-pressure: a congested manager stops reading and the worker blocks
/// on its next stdout write.
async fn read_worker_stdout(
    mut child: Child,
    stdout: ChildStdout,
    records: mpsc::Sender<WorkerRecord>,
    kill_rx: oneshot::Receiver<()>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut kill_rx = Some(kill_rx);
    let mut saw_terminal = false;

    loop {
        let line = if let Some(rx) = kill_rx.as_mut() {
            tokio::select! {
                line = lines.next_line() => line,
                _ = rx => {
                    debug!("killing worker process");
                    let _ = child.start_kill();
                    kill_rx = None;
                    continue;
                }
            }
        } else {
            lines.next_line().await
        };

        match line {
            Ok(Some(line)) => {
                let record = match WorkerRecord::decode(&line) {
                    Ok(record) => record,
                    Err(err) => WorkerRecord::Log {
                        level: "warn".to_string(),
                        message: format!("unparseable worker record: {err}"),
                    },
                };
                saw_terminal |= record.is_terminal();
                if records.send(record).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "worker pipe read failed");
                break;
            }
        }
    }

    let status = child.wait().await.ok();
    if !saw_terminal {
        let (run_status, error) = status_for_exit_code(status.and_then(|s| s.code()));
        let _ = records
            .send(WorkerRecord::Terminal {
                status: run_status,
                error: (!error.is_empty()).then_some(error),
                summary: None,
            })
            .await;
    }
}

/// Runs the worker in-process on a blocking thread. Used by tests and
/// embedders that do not want process isolation; the record stream is
/// identical to the subprocess path.
pub struct LocalLauncher {
    registry: Arc<Registry>,
}

impl LocalLauncher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Launcher for LocalLauncher {
    async fn launch(
        &self,
        run_id: &str,
        config: serde_json::Value,
    ) -> Result<WorkerHandle, OrchestratorError> {
        let (record_tx, record_rx) = mpsc::channel(256);
        let cancel = CancelToken::new();
        let registry = self.registry.clone();
        let run_id = run_id.to_string();
        let worker_cancel = cancel.clone();
        let runtime = tokio::runtime::Handle::current();

        tokio::task::spawn_blocking(move || {
            let sink: RecordSink = Arc::new(move |record| {
                let _ = record_tx.blocking_send(record);
            });
            worker::execute_run(
                &registry,
                &run_id,
                &config,
                ValidationMode::Forward,
                worker_cancel,
                Some(&runtime),
                sink,
            );
        });

        Ok(WorkerHandle {
            records: record_rx,
            canceler: Box::new(move || cancel.cancel()),
            killer: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;

    fn config(name: &str) -> serde_json::Value {
        json!({
            "name": name,
            "data_feed": {"type": "inmemory", "bars": []},
        })
    }

    async fn wait_for_status(store: &RunStore, run_id: &str, status: RunStatus) {
        for _ in 0..200 {
            if store.get(run_id).await.unwrap().unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "run {run_id} never reached {status}; currently {}",
            store.get(run_id).await.unwrap().unwrap().status
        );
    }

    /// Commands a gated test worker reacts to.
    #[derive(Debug, Clone, Copy)]
    enum GateCommand {
        Release,
        Cancel,
        Kill,
    }

    /// Launcher whose workers finish only when released, so admission
    /// ordering is fully deterministic. The worker task is the sole owner
    /// of the record sender; exiting it closes the stream.
    #[derive(Default)]
    struct GateLauncher {
        gates: Mutex<HashMap<String, mpsc::Sender<GateCommand>>>,
        /// When true, workers ignore cancel (exercises the kill path).
        ignore_cancel: bool,
    }

    impl GateLauncher {
        fn release(&self, run_id: &str) {
            if let Some(gate) = self.gates.lock().get(run_id) {
                let _ = gate.try_send(GateCommand::Release);
            }
        }
    }

    #[async_trait]
    impl Launcher for GateLauncher {
        async fn launch(
            &self,
            run_id: &str,
            _config: serde_json::Value,
        ) -> Result<WorkerHandle, OrchestratorError> {
            let (command_tx, mut command_rx) = mpsc::channel(8);
            self.gates.lock().insert(run_id.to_string(), command_tx.clone());
            let (record_tx, record_rx) = mpsc::channel(16);

            let ignore_cancel = self.ignore_cancel;
            tokio::spawn(async move {
                while let Some(command) = command_rx.recv().await {
                    let status = match command {
                        GateCommand::Release => RunStatus::Succeeded,
                        GateCommand::Cancel if !ignore_cancel => RunStatus::Canceled,
                        GateCommand::Cancel => continue,
                        // Die without a terminal record.
                        GateCommand::Kill => return,
                    };
                    let _ = record_tx
                        .send(WorkerRecord::Terminal {
                            status,
                            error: None,
                            summary: None,
                        })
                        .await;
                    return;
                }
            });

            let cancel_tx = command_tx.clone();
            let canceler = Box::new(move || {
                let _ = cancel_tx.try_send(GateCommand::Cancel);
            });
            let killer: Box<dyn FnOnce() + Send> = Box::new(move || {
                let _ = command_tx.try_send(GateCommand::Kill);
            });

            Ok(WorkerHandle {
                records: record_rx,
                canceler,
                killer: Some(killer),
            })
        }
    }

    #[tokio::test]
    async fn bounded_admission() {
        // max_concurrent_runs = 2, five submissions: two run, three queue,
        // and completions pull the queue through in order.
        let store = RunStore::in_memory().await.unwrap();
        let launcher = Arc::new(GateLauncher::default());
        let manager = RunManager::new(
            store.clone(),
            launcher.clone(),
            ManagerConfig {
                max_concurrent_runs: 2,
                ..ManagerConfig::default()
            },
            Vec::new(),
        );

        let mut ids = Vec::new();
        for index in 0..5 {
            ids.push(
                manager
                    .submit(config(&format!("run-{index}")), ValidationMode::Strict)
                    .await
                    .unwrap(),
            );
        }

        wait_for_status(&store, &ids[0], RunStatus::Running).await;
        wait_for_status(&store, &ids[1], RunStatus::Running).await;
        for id in &ids[2..] {
            assert_eq!(store.get(id).await.unwrap().unwrap().status, RunStatus::Pending);
        }
        assert_eq!(manager.active_count(), 2);
        assert_eq!(manager.queued_count(), 3);

        // Each completion starts the next queued run.
        launcher.release(&ids[0]);
        wait_for_status(&store, &ids[0], RunStatus::Succeeded).await;
        wait_for_status(&store, &ids[2], RunStatus::Running).await;

        launcher.release(&ids[1]);
        launcher.release(&ids[2]);
        wait_for_status(&store, &ids[3], RunStatus::Running).await;
        wait_for_status(&store, &ids[4], RunStatus::Running).await;
        launcher.release(&ids[3]);
        launcher.release(&ids[4]);

        for id in &ids {
            wait_for_status(&store, id, RunStatus::Succeeded).await;
        }
        assert_eq!(manager.active_count(), 0);
        assert_eq!(manager.queued_count(), 0);
    }

    #[tokio::test]
    async fn queue_overflow_is_resource_exhausted() {
        let store = RunStore::in_memory().await.unwrap();
        let launcher = Arc::new(GateLauncher::default());
        let manager = RunManager::new(
            store.clone(),
            launcher,
            ManagerConfig {
                max_concurrent_runs: 1,
                queue_capacity: 1,
                ..ManagerConfig::default()
            },
            Vec::new(),
        );

        manager.submit(config("a"), ValidationMode::Strict).await.unwrap();
        manager.submit(config("b"), ValidationMode::Strict).await.unwrap();
        let err = manager.submit(config("c"), ValidationMode::Strict).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ResourceExhausted { .. }));
        // The rejected run was never persisted.
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalid_config_rejected_at_submit() {
        let store = RunStore::in_memory().await.unwrap();
        let manager = RunManager::new(
            store.clone(),
            Arc::new(GateLauncher::default()),
            ManagerConfig::default(),
            Vec::new(),
        );
        let err = manager
            .submit(json!({"name": ""}), ValidationMode::Strict)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_queued_run() {
        let store = RunStore::in_memory().await.unwrap();
        let launcher = Arc::new(GateLauncher::default());
        let manager = RunManager::new(
            store.clone(),
            launcher.clone(),
            ManagerConfig {
                max_concurrent_runs: 1,
                ..ManagerConfig::default()
            },
            Vec::new(),
        );

        let first = manager.submit(config("a"), ValidationMode::Strict).await.unwrap();
        let queued = manager.submit(config("b"), ValidationMode::Strict).await.unwrap();

        manager.cancel(&queued).await.unwrap();
        wait_for_status(&store, &queued, RunStatus::Canceled).await;

        launcher.release(&first);
        wait_for_status(&store, &first, RunStatus::Succeeded).await;
        assert_eq!(manager.queued_count(), 0);
    }

    #[tokio::test]
    async fn cancel_active_run_cooperatively() {
        let store = RunStore::in_memory().await.unwrap();
        let launcher = Arc::new(GateLauncher::default());
        let manager = RunManager::new(
            store.clone(),
            launcher,
            ManagerConfig::default(),
            Vec::new(),
        );

        let id = manager.submit(config("a"), ValidationMode::Strict).await.unwrap();
        wait_for_status(&store, &id, RunStatus::Running).await;
        manager.cancel(&id).await.unwrap();
        wait_for_status(&store, &id, RunStatus::Canceled).await;
    }

    #[tokio::test]
    async fn unresponsive_worker_is_force_killed() {
        let store = RunStore::in_memory().await.unwrap();
        let launcher = Arc::new(GateLauncher {
            ignore_cancel: true,
            ..GateLauncher::default()
        });
        let manager = RunManager::new(
            store.clone(),
            launcher,
            ManagerConfig {
                cancel_grace: Duration::from_millis(50),
                ..ManagerConfig::default()
            },
            Vec::new(),
        );

        let id = manager.submit(config("a"), ValidationMode::Strict).await.unwrap();
        wait_for_status(&store, &id, RunStatus::Running).await;
        manager.cancel(&id).await.unwrap();
        // The worker ignores the cancel; after the grace period the killer
        // ends the stream and the run is marked canceled.
        wait_for_status(&store, &id, RunStatus::Canceled).await;
    }

    struct CollectingSink {
        events: Mutex<Vec<EventRecord>>,
    }

    #[async_trait]
    impl EventSink for CollectingSink {
        async fn on_event(&self, record: &EventRecord) {
            self.events.lock().push(record.clone());
        }
    }

    fn backtest_config() -> serde_json::Value {
        let bars: Vec<serde_json::Value> = (0..15)
            .map(|index| {
                let price = format!("{}", 100.0 + index as f64);
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
            "name": "local-e2e",
            "data_feed": {"type": "inmemory", "bars": bars},
            "strategies": [
                {"type": "moving_average", "symbol": "SPY", "short_window": 2, "long_window": 4},
            ],
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn local_end_to_end_run() {
        let store = RunStore::in_memory().await.unwrap();
        let sink = Arc::new(CollectingSink {
            events: Mutex::new(Vec::new()),
        });
        let manager = RunManager::new(
            store.clone(),
            Arc::new(LocalLauncher::new(Arc::new(Registry::new()))),
            ManagerConfig::default(),
            vec![sink.clone()],
        );

        let id = manager
            .submit(backtest_config(), ValidationMode::Strict)
            .await
            .unwrap();
        wait_for_status(&store, &id, RunStatus::Succeeded).await;

        let run = manager.get(&id).await.unwrap();
        assert!(run.progress > 0.99);

        // Events made it to the durable log, the sink, and the stream.
        let stored = store.recent_events(&id, 256).await.unwrap();
        assert!(stored.iter().any(|e| e.kind == model::EventKind::Fill));
        assert!(!sink.events.lock().is_empty());

        let mut stream = manager.stream(&id).await.unwrap();
        let mut saw_terminal = false;
        let mut last_seq = None;
        while let Some(item) = stream.recv().await {
            match item {
                StreamItem::Event(event) => {
                    if let Some(last) = last_seq {
                        assert!(event.seq > last);
                    }
                    last_seq = Some(event.seq);
                }
                StreamItem::Terminal { status } => {
                    assert_eq!(status, RunStatus::Succeeded);
                    saw_terminal = true;
                }
                StreamItem::Progress { .. } => {}
            }
        }
        assert!(saw_terminal);
    }
}
