// ABOUTME: Thread-affinity policies a task can be bound to
// ABOUTME: Defines TaskAffinity and TaskRunOptions with parsing and display helpers

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Where a task body is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskAffinity {
    /// Shared pool, in parallel with other concurrent work but never alongside exclusive work.
    #[default]
    Concurrent,
    /// One at a time, in submission order, excluding concurrent work.
    Exclusive,
    /// The designated UI thread only.
    Ui,
    /// A dedicated thread outside the shared pool.
    LongRunning,
    /// Shared pool without taking part in the exclusive/concurrent gate.
    None,
}

/// Which outcome of a task triggers a continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskRunOptions {
    #[default]
    OnSuccess,
    OnFailure,
    OnAlways,
}

impl std::fmt::Display for TaskAffinity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskAffinity::Concurrent => write!(f, "concurrent"),
            TaskAffinity::Exclusive => write!(f, "exclusive"),
            TaskAffinity::Ui => write!(f, "ui"),
            TaskAffinity::LongRunning => write!(f, "long-running"),
            TaskAffinity::None => write!(f, "none"),
        }
    }
}

impl FromStr for TaskAffinity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "concurrent" => Ok(TaskAffinity::Concurrent),
            "exclusive" => Ok(TaskAffinity::Exclusive),
            "ui" => Ok(TaskAffinity::Ui),
            "long-running" | "longrunning" | "long_running" => Ok(TaskAffinity::LongRunning),
            "none" | "threadpool" | "thread-pool" => Ok(TaskAffinity::None),
            other => Err(format!("unknown affinity '{}'", other)),
        }
    }
}
