// ABOUTME: Common utilities and helpers for integration tests
// ABOUTME: Provides task manager factories, call recorders and shell process descriptors

#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskchain::engine::{SchedulerConfig, TaskManager};
use taskchain::process::{ProcessManager, ProcessSettings, ProcessStartInfo};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn manager() -> TaskManager {
    TaskManager::new(&SchedulerConfig {
        worker_threads: 2,
        max_blocking_threads: 16,
    })
    .expect("Failed to create task manager")
}

pub fn process_manager(tasks: &TaskManager) -> ProcessManager {
    ProcessManager::new(
        tasks,
        ProcessSettings {
            idle_timeout_ms: 200,
            stop_grace_ms: 100,
            ..ProcessSettings::default()
        },
    )
}

/// Launch descriptor running `script` through `sh -c`.
pub fn sh(script: &str) -> ProcessStartInfo {
    ProcessStartInfo::new("sh").arg("-c").arg(script)
}

/// Collects events from handlers running on any thread.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| e.as_str() == event).count()
    }
}

/// Channel used to wait for a handler that runs off the test thread.
pub fn signal<T>() -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
    mpsc::channel()
}
