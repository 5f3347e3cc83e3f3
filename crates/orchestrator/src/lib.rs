//! Run orchestration.
//!
//! The controller side of the runtime: validate a submitted configuration
//! document, persist a [`model::Run`], admit it under a concurrency bound,
//! launch an isolated worker, relay the worker's framed records back into
//! the [`RunStore`] and per-run fan-out, and hand event streams to any
//! number of subscribers.
//!
//! Worker isolation is behind the [`Launcher`] seam: production spawns the
//! current executable as a `worker` subprocess speaking JSON Lines over
//! stdio; tests (and one-shot local runs) use [`LocalLauncher`] with the
//! identical record stream.

pub mod config;
mod error;
mod fanout;
mod ipc;
mod manager;
mod store;
pub mod worker;

pub use config::{Registry, RunConfig, ValidationMode};
pub use error::{ConfigError, OrchestratorError};
pub use fanout::{FanOut, StreamItem};
pub use ipc::{exit_code_for, WorkerRecord, EXIT_CANCELED, EXIT_CONFIG_INVALID, EXIT_FEED_ERROR, EXIT_INTERNAL, EXIT_OK};
pub use manager::{
    EventSink, Launcher, LocalLauncher, ManagerConfig, ProcessLauncher, RunManager, WorkerHandle,
};
pub use store::RunStore;
