//! Worker-to-manager IPC records.
//!
//! The worker emits a totally ordered sequence of framed records - JSON
//! Lines over its stdout. There is no drop inside this path: the pipe's
//! buffer is the back-pressure, and a congested manager stalls the
//! worker's engine at its next write.

use engine_core::EngineSummary;
use model::{EventRecord, RunStatus};
use serde::{Deserialize, Serialize};

/// Worker exit codes.
pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG_INVALID: i32 = 2;
pub const EXIT_FEED_ERROR: i32 = 3;
pub const EXIT_INTERNAL: i32 = 4;
pub const EXIT_CANCELED: i32 = 5;

/// One framed record on the worker's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerRecord {
    /// A pipeline event, already projected to the transport-safe envelope.
    Event { record: EventRecord },
    /// Fraction of the feed consumed, in `[0, 1]`.
    Progress { fraction: f64 },
    /// A log line the worker wants surfaced by the controller.
    Log { level: String, message: String },
    /// The final record; nothing follows it.
    Terminal {
        status: RunStatus,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        summary: Option<EngineSummary>,
    },
}

impl WorkerRecord {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }
}

/// Exit code matching a terminal status/error pair.
pub fn exit_code_for(status: RunStatus, config_invalid: bool, feed_error: bool) -> i32 {
    match status {
        RunStatus::Succeeded => EXIT_OK,
        RunStatus::Canceled => EXIT_CANCELED,
        _ if config_invalid => EXIT_CONFIG_INVALID,
        _ if feed_error => EXIT_FEED_ERROR,
        _ => EXIT_INTERNAL,
    }
}

/// Terminal status synthesized when a worker dies without sending one.
pub fn status_for_exit_code(code: Option<i32>) -> (RunStatus, String) {
    match code {
        Some(EXIT_OK) => (RunStatus::Succeeded, String::new()),
        Some(EXIT_CANCELED) => (RunStatus::Canceled, "worker canceled".to_string()),
        Some(EXIT_CONFIG_INVALID) => (RunStatus::Failed, "config_invalid".to_string()),
        Some(EXIT_FEED_ERROR) => (RunStatus::Failed, "feed_error".to_string()),
        Some(code) => (RunStatus::Failed, format!("worker exited with code {code}")),
        None => (RunStatus::Failed, "worker killed by signal".to_string()),
    }
}
