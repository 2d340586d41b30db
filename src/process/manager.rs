// ABOUTME: Tracks running processes and prepares launch descriptors for process tasks
// ABOUTME: Applies the process environment and stops every tracked process on request

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use super::environment::{ProcessEnvironment, ProcessStartInfo};
use super::wrapper::ProcessHandle;
use super::ProcessSettings;
use crate::engine::TaskManager;

/// Creates process tasks and keeps a registry of the processes they run.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<ProcessManagerInner>,
}

struct ProcessManagerInner {
    tasks: TaskManager,
    environment: ProcessEnvironment,
    settings: ProcessSettings,
    running: Mutex<HashMap<u32, ProcessHandle>>,
}

impl ProcessManager {
    pub fn new(tasks: &TaskManager, settings: ProcessSettings) -> Self {
        Self {
            inner: Arc::new(ProcessManagerInner {
                tasks: tasks.clone(),
                environment: ProcessEnvironment::new(&settings),
                settings,
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn with_environment(
        tasks: &TaskManager,
        settings: ProcessSettings,
        environment: ProcessEnvironment,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessManagerInner {
                tasks: tasks.clone(),
                environment,
                settings,
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.inner.tasks
    }

    pub fn environment(&self) -> &ProcessEnvironment {
        &self.inner.environment
    }

    pub fn settings(&self) -> &ProcessSettings {
        &self.inner.settings
    }

    /// Apply the working directory and environment to a launch descriptor.
    pub fn configure(
        &self,
        mut info: ProcessStartInfo,
        working_directory: Option<&Path>,
    ) -> ProcessStartInfo {
        self.inner.environment.configure(&mut info, working_directory);
        info
    }

    pub(crate) fn register(&self, handle: &ProcessHandle) {
        if let Some(pid) = handle.id() {
            debug!("Tracking process {}", pid);
            self.lock().insert(pid, handle.clone());
        }
    }

    pub(crate) fn unregister(&self, handle: &ProcessHandle) {
        if let Some(pid) = handle.id() {
            self.lock().remove(&pid);
        }
    }

    /// Ids of the processes currently running under this manager.
    pub fn running(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.lock().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Stop every tracked process.
    pub fn stop_all(&self) {
        let handles: Vec<ProcessHandle> = self.lock().values().cloned().collect();
        if !handles.is_empty() {
            info!("Stopping {} running processes", handles.len());
        }
        for handle in handles {
            handle.stop(false);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, ProcessHandle>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
