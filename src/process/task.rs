// ABOUTME: Tasks that run an external process and produce the result of its output processor
// ABOUTME: Wires process lifecycle hooks, data events and the process registry into the task chain

use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::environment::ProcessStartInfo;
use super::error::ProcessError;
use super::manager::ProcessManager;
use super::wrapper::{ProcessHandle, ProcessWrapper};
use super::ProcessSettings;
use crate::engine::{Payload, Task, TaskAffinity, TaskError};
use crate::output::{
    FirstNonNullLineOutputProcessor, OutputProcessor, SimpleListOutputProcessor,
    SimpleOutputProcessor,
};

type ProcessHook = Arc<dyn Fn(&ProcessHandle) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&str) + Send + Sync>;

/// A task running one external process.
///
/// Derefs to the underlying [`Task`], so it chains like any other task.
pub struct ProcessTask<R> {
    task: Task<R>,
    state: Arc<ProcessTaskState>,
}

impl<R> Clone for ProcessTask<R> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

struct ProcessTaskState {
    processes: ProcessManager,
    info: Mutex<ProcessStartInfo>,
    settings: Mutex<ProcessSettings>,
    handle: Mutex<Option<ProcessHandle>>,
    on_start: Mutex<Vec<ProcessHook>>,
    on_end: Mutex<Vec<ProcessHook>>,
    on_error: Mutex<Vec<ErrorHook>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ProcessTaskState {
    fn started(&self, handle: &ProcessHandle) {
        self.processes.register(handle);
        *lock(&self.handle) = Some(handle.clone());
        let hooks = lock(&self.on_start).clone();
        for hook in hooks {
            hook(handle);
        }
    }

    fn ended(&self, handle: &ProcessHandle) {
        self.processes.unregister(handle);
        let hooks = lock(&self.on_end).clone();
        for hook in hooks {
            hook(handle);
        }
    }

    fn error_data(&self, errors: &str) {
        let hooks = lock(&self.on_error).clone();
        for hook in hooks {
            hook(errors);
        }
    }
}

impl ProcessTask<Option<String>> {
    /// Resolves with the first non-empty line of output, trimmed.
    pub fn first_line(processes: &ProcessManager, info: ProcessStartInfo) -> Self {
        Self::with_processor(processes, info, FirstNonNullLineOutputProcessor::new())
    }
}

impl ProcessTask<String> {
    /// Resolves with the whole output, lines joined by `\n`.
    pub fn simple(processes: &ProcessManager, info: ProcessStartInfo) -> Self {
        Self::with_processor(processes, info, SimpleOutputProcessor::new())
    }
}

impl ProcessTask<Vec<String>> {
    /// Resolves with the list of output lines.
    pub fn lines(processes: &ProcessManager, info: ProcessStartInfo) -> Self {
        Self::with_processor(processes, info, SimpleListOutputProcessor::new())
    }
}

impl<R: Payload> ProcessTask<R> {
    /// A task feeding the process output to `processor` and resolving with its result.
    ///
    /// Every entry the processor raises is published as a data event of type `P::Entry`.
    pub fn with_processor<P>(processes: &ProcessManager, info: ProcessStartInfo, processor: P) -> Self
    where
        P: OutputProcessor<Output = R>,
    {
        let info = processes.configure(info, None);
        let name = display_name(&info);
        let state = Arc::new(ProcessTaskState {
            processes: processes.clone(),
            info: Mutex::new(info),
            settings: Mutex::new(processes.settings().clone()),
            handle: Mutex::new(None),
            on_start: Mutex::new(Vec::new()),
            on_end: Mutex::new(Vec::new()),
            on_error: Mutex::new(Vec::new()),
        });

        let body_state = Arc::clone(&state);
        let task = processes.task_manager().create(
            &name,
            TaskAffinity::Concurrent,
            move |ctx| {
                let mut processor = processor;
                let info = lock(&body_state.info).clone();
                let settings = lock(&body_state.settings).clone();
                let name = ctx.task().name();
                let wrapper = ProcessWrapper::new(name.clone(), info, settings, ctx.token().clone());

                let mut started: Option<ProcessHandle> = None;
                let mut stderr: Vec<String> = Vec::new();
                let outcome = ctx.scheduler().block_on(wrapper.run(
                    &mut processor,
                    |handle| {
                        body_state.started(handle);
                        started = Some(handle.clone());
                    },
                    |entry| ctx.raise_data(entry),
                    |line| {
                        debug!("{} stderr: {}", name, line);
                        stderr.push(line.to_string());
                    },
                ));

                if let Some(handle) = &started {
                    body_state.ended(handle);
                }
                if !stderr.is_empty() {
                    body_state.error_data(&stderr.join("\n"));
                }

                match outcome {
                    Ok(_) => Ok(processor.result()),
                    // Never launched because the manager was already stopping.
                    Err(ProcessError::Cancelled) if started.is_none() => {
                        Err(anyhow::Error::new(TaskError::Cancelled))
                    }
                    Err(e) => Err(anyhow::Error::new(e)),
                }
            },
        );

        Self { task, state }
    }

    /// Run on a dedicated thread instead of the shared pool.
    pub fn long_running(self) -> Self {
        let task = self.task.clone().with_affinity(TaskAffinity::LongRunning);
        Self { task, ..self }
    }

    pub fn named(self, name: impl Into<String>) -> Self {
        let task = self.task.clone().named(name);
        Self { task, ..self }
    }

    pub fn with_affinity(self, affinity: TaskAffinity) -> Self {
        let task = self.task.clone().with_affinity(affinity);
        Self { task, ..self }
    }

    /// Idle window once cancellation is requested, at millisecond resolution.
    pub fn with_idle_timeout(self, timeout: Duration) -> Self {
        lock(&self.state.settings).idle_timeout_ms = millis(timeout);
        self
    }

    /// Hard lifetime limit, at millisecond resolution.
    pub fn with_exit_timeout(self, timeout: Duration) -> Self {
        lock(&self.state.settings).exit_timeout_ms = Some(millis(timeout));
        self
    }

    pub fn with_working_directory(self, directory: impl AsRef<Path>) -> Self {
        {
            let mut info = lock(&self.state.info);
            let configured = self
                .state
                .processes
                .configure(info.clone(), Some(directory.as_ref()));
            *info = configured;
        }
        self
    }

    pub fn info(&self) -> ProcessStartInfo {
        lock(&self.state.info).clone()
    }

    /// Handle of the running process, once it has started.
    pub fn handle(&self) -> Option<ProcessHandle> {
        lock(&self.state.handle).clone()
    }

    pub fn process_id(&self) -> Option<u32> {
        self.handle().and_then(|handle| handle.id())
    }

    /// Stop the process if it is running.
    pub fn stop(&self) {
        if let Some(handle) = self.handle() {
            handle.stop(false);
        }
    }

    pub fn start(&self) -> Self {
        self.task.start();
        self.clone()
    }

    pub fn task(&self) -> &Task<R> {
        &self.task
    }

    pub fn on_start_process<F>(&self, hook: F) -> Self
    where
        F: Fn(&ProcessHandle) + Send + Sync + 'static,
    {
        lock(&self.state.on_start).push(Arc::new(hook));
        self.clone()
    }

    pub fn on_end_process<F>(&self, hook: F) -> Self
    where
        F: Fn(&ProcessHandle) + Send + Sync + 'static,
    {
        lock(&self.state.on_end).push(Arc::new(hook));
        self.clone()
    }

    /// Receives the captured stderr, joined by `\n`, once the process has ended.
    pub fn on_error_data<F>(&self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        lock(&self.state.on_error).push(Arc::new(hook));
        self.clone()
    }
}

impl<R> Deref for ProcessTask<R> {
    type Target = Task<R>;

    fn deref(&self) -> &Task<R> {
        &self.task
    }
}

fn display_name(info: &ProcessStartInfo) -> String {
    if info.has_credentials() {
        info.executable.display().to_string()
    } else {
        info.command_line()
    }
}
