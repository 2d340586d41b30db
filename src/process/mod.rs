// ABOUTME: External process execution as chainable tasks
// ABOUTME: Exposes launch descriptors, the process wrapper, process tasks and their settings

pub mod environment;
pub mod error;
pub mod manager;
pub mod task;
pub mod wrapper;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use environment::{ProcessEnvironment, ProcessStartInfo};
pub use error::{ProcessError, Result};
pub use manager::ProcessManager;
pub use task::ProcessTask;
pub use wrapper::{ProcessHandle, ProcessOutcome, ProcessWrapper};

/// Timing and environment settings applied to every process a manager launches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessSettings {
    /// Once cancellation is requested, a process silent for this long is stopped.
    pub idle_timeout_ms: u64,

    /// Time a process gets to exit after the interrupt byte before it is killed.
    pub stop_grace_ms: u64,

    /// Time waited for a killed process to be reaped.
    pub kill_grace_ms: u64,

    /// Quiet period after exit during which trailing output is still collected.
    pub exit_drain_ms: u64,

    /// Hard limit on the lifetime of a process. `None` means no limit.
    pub exit_timeout_seconds: Option<u64>,

    /// Millisecond form of the lifetime limit. Takes precedence over `exit_timeout_seconds`.
    pub exit_timeout_ms: Option<u64>,

    /// Directories put in front of `PATH`.
    pub search_paths: Vec<PathBuf>,

    /// Variables added to every process environment.
    pub environment: IndexMap<String, String>,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 500,
            stop_grace_ms: 500,
            kill_grace_ms: 100,
            exit_drain_ms: 100,
            exit_timeout_seconds: None,
            exit_timeout_ms: None,
            search_paths: Vec::new(),
            environment: IndexMap::new(),
        }
    }
}

impl ProcessSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn exit_drain(&self) -> Duration {
        Duration::from_millis(self.exit_drain_ms)
    }

    pub fn exit_timeout(&self) -> Option<Duration> {
        self.exit_timeout_ms
            .map(Duration::from_millis)
            .or_else(|| self.exit_timeout_seconds.map(Duration::from_secs))
    }
}
