// ABOUTME: Task manager owning the task arena, the scheduler and the shared cancellation token
// ABOUTME: Implements chaining, the run step and continuation selection for every task

use chrono::Utc;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::affinity::{TaskAffinity, TaskRunOptions};
use super::error::{Result, TaskError};
use super::graph::{
    Body, CatchOutcome, DataFn, FinallyHandler, TaskGraph, TaskId, TaskNode, TaskState, TaskValue,
};
use super::progress::Progress;
use super::scheduler::{AffinityScheduler, SchedulerConfig};
use super::task::{Payload, RunContext, Task, TaskRef};

/// Entry point for building and running task chains.
///
/// Cloning is cheap; every clone refers to the same arena and scheduler. The scheduler shuts down
/// when the last manager clone and the last task handle are gone.
#[derive(Clone)]
pub struct TaskManager {
    pub(crate) inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    graph: Mutex<TaskGraph>,
    scheduler: AffinityScheduler,
    token: CancellationToken,
    next_handler_id: AtomicU64,
}

impl TaskManager {
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        let scheduler = AffinityScheduler::new(config)?;
        Ok(Self::with_scheduler(scheduler))
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(&SchedulerConfig::default())
    }

    pub fn with_scheduler(scheduler: AffinityScheduler) -> Self {
        let token = scheduler.token();
        Self {
            inner: Arc::new(ManagerInner {
                graph: Mutex::new(TaskGraph::default()),
                scheduler,
                token,
                next_handler_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn scheduler(&self) -> &AffinityScheduler {
        &self.inner.scheduler
    }

    /// Cancellation signal every task created here observes unless given its own.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Cancel every task of this manager. Tasks that have not started yet fail with
    /// [`TaskError::Cancelled`]; running process tasks stop their child.
    pub fn stop(&self) {
        debug!("Stopping task manager");
        self.inner.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn in_ui_thread(&self) -> bool {
        self.inner.scheduler.in_ui_thread()
    }

    /// Number of tasks ever created by this manager.
    pub fn task_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Create a task from a body that sees the full run context.
    pub fn create<R, F>(&self, name: &str, affinity: TaskAffinity, body: F) -> Task<R>
    where
        R: Payload,
        F: FnOnce(&RunContext<'_>) -> anyhow::Result<R> + Send + 'static,
    {
        let body: Body = Box::new(move |ctx| match body(ctx) {
            Ok(value) => Ok(Arc::new(value) as TaskValue),
            Err(e) => Err(TaskError::from_fault(e)),
        });
        let id = self.inner.insert(name, affinity, body);
        Task::from_ref(TaskRef::new(Arc::clone(&self.inner), id))
    }

    /// A task running `f` with the success flag of its predecessor.
    pub fn action<F>(&self, f: F) -> Task<()>
    where
        F: FnOnce(bool) -> anyhow::Result<()> + Send + 'static,
    {
        self.create("Action", TaskAffinity::Concurrent, move |ctx| {
            f(ctx.previous_success())
        })
    }

    /// A task receiving the success flag and the error of its predecessor.
    pub fn action_with_error<F>(&self, f: F) -> Task<()>
    where
        F: FnOnce(bool, Option<&TaskError>) -> anyhow::Result<()> + Send + 'static,
    {
        self.create("Action", TaskAffinity::Concurrent, move |ctx| {
            f(ctx.previous_success(), ctx.previous_error())
        })
    }

    /// A task receiving the typed result of its predecessor.
    pub fn action_with_data<P, F>(&self, f: F) -> Task<()>
    where
        P: Payload,
        F: FnOnce(bool, Option<P>) -> anyhow::Result<()> + Send + 'static,
    {
        self.create("Action", TaskAffinity::Concurrent, move |ctx| {
            f(ctx.previous_success(), ctx.previous::<P>())
        })
    }

    pub fn func<R, F>(&self, f: F) -> Task<R>
    where
        R: Payload,
        F: FnOnce(bool) -> anyhow::Result<R> + Send + 'static,
    {
        self.create("Func", TaskAffinity::Concurrent, move |ctx| {
            f(ctx.previous_success())
        })
    }

    pub fn func_with_data<P, R, F>(&self, f: F) -> Task<R>
    where
        P: Payload,
        R: Payload,
        F: FnOnce(bool, Option<P>) -> anyhow::Result<R> + Send + 'static,
    {
        self.create("Func", TaskAffinity::Concurrent, move |ctx| {
            f(ctx.previous_success(), ctx.previous::<P>())
        })
    }

    pub fn func_list<R, F>(&self, f: F) -> Task<Vec<R>>
    where
        R: Payload,
        F: FnOnce(bool) -> anyhow::Result<Vec<R>> + Send + 'static,
    {
        self.create("FuncList", TaskAffinity::Concurrent, move |ctx| {
            f(ctx.previous_success())
        })
    }

    /// A task whose body is a future, driven to completion on the task's thread.
    pub fn with_async<R, F, Fut>(&self, f: F) -> Task<R>
    where
        R: Payload,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.create("Async", TaskAffinity::None, move |ctx| {
            ctx.scheduler().block_on(f())
        })
    }
}

impl ManagerInner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, TaskGraph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn scheduler(&self) -> &AffinityScheduler {
        &self.scheduler
    }

    pub(crate) fn next_handler_id(&self) -> u64 {
        self.next_handler_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn insert(&self, name: &str, affinity: TaskAffinity, body: Body) -> TaskId {
        let node = TaskNode::new(name.to_string(), affinity, self.token.clone(), body);
        self.lock().insert(node)
    }

    /// Wire `next`'s chain behind `from`.
    pub(crate) fn link(
        &self,
        from: TaskId,
        next: TaskId,
        options: TaskRunOptions,
        is_top_of_chain: bool,
    ) {
        let mut graph = self.lock();
        let target = if is_top_of_chain {
            next
        } else {
            graph.root(next)
        };
        if let Some(node) = graph.get_mut(target) {
            node.depends_on = Some(from);
        }
        let Some(target_node) = graph.get(target) else {
            return;
        };

        match options {
            TaskRunOptions::OnSuccess => {
                let mut faults = target_node.fault_handlers.clone();
                faults.extend(target_node.on_failure.or(target_node.on_always));
                let catches: Vec<_> = target_node
                    .catch_handlers
                    .iter()
                    .filter(|h| !h.local)
                    .cloned()
                    .collect();
                let finals = target_node.finally_handlers.clone();

                if let Some(node) = graph.get_mut(from) {
                    node.on_success = Some(target);
                }
                for fault in faults {
                    graph.add_fault_handler(from, fault);
                }
                let upward = graph.self_and_ancestors(from);
                for handler in &catches {
                    graph.add_catch(&upward, handler);
                }
                for handler in &finals {
                    graph.add_finally(&upward, handler);
                }
            }
            TaskRunOptions::OnFailure | TaskRunOptions::OnAlways => {
                let parent = graph.get_mut(from).and_then(|node| {
                    if options == TaskRunOptions::OnFailure {
                        node.on_failure = Some(target);
                    } else {
                        node.on_always = Some(target);
                    }
                    node.depends_on
                });
                if let Some(parent) = parent {
                    graph.add_fault_handler(parent, target);
                }
            }
        }

        let own = graph
            .get(from)
            .map(|n| n.finally_handlers.clone())
            .unwrap_or_default();
        if !own.is_empty() {
            let path = graph.path_from_end(target, Some(from));
            for handler in &own {
                graph.add_finally(&path, handler);
            }
        }
    }

    /// Schedule the earliest unstarted task of `id`'s chain.
    pub(crate) fn start(self: &Arc<Self>, id: TaskId) {
        let top = {
            let mut graph = self.lock();
            let top = graph.top_most_startable(id);
            if let Some(node) = top.and_then(|t| graph.get_mut(t)) {
                node.state = TaskState::Scheduled;
            }
            top
        };
        match top {
            Some(top) => self.dispatch(top),
            None => debug!("Chain of task {} already started", id),
        }
    }

    /// Hand an already claimed task to the execution context of its affinity.
    fn dispatch(self: &Arc<Self>, id: TaskId) {
        let Some(affinity) = self.lock().get(id).map(|n| n.affinity) else {
            return;
        };
        let manager = Arc::clone(self);
        if let Err(e) = self
            .scheduler
            .schedule(affinity, Box::new(move || manager.run(id)))
        {
            error!("Failed to schedule task {}: {}", id, e);
            self.abort(id, e);
        }
    }

    /// Complete a task that could not be run and let its chain resolve.
    fn abort(self: &Arc<Self>, id: TaskId, error: TaskError) {
        {
            let mut graph = self.lock();
            let Some(node) = graph.get_mut(id) else {
                return;
            };
            node.body = None;
            node.state = TaskState::Completed;
            node.outcome.has_run = true;
            node.outcome.failed = true;
            node.outcome.error = Some(error.clone());
            node.outcome.ended_at = Some(Utc::now());
        }
        self.raise_end(id, false, Some(&error));
        self.setup_continuations(id);
        self.release(id);
    }

    /// The run step, executed on the thread chosen by the scheduler.
    pub(crate) fn run(self: &Arc<Self>, id: TaskId) {
        let task = TaskRef::new(Arc::clone(self), id);
        let prepared = {
            let mut graph = self.lock();
            let depends = graph.get(id).and_then(|n| n.depends_on).and_then(|d| {
                graph
                    .get(d)
                    .map(|dep| (dep.outcome.successful(), dep.outcome.value.clone()))
            });
            let Some(node) = graph.get_mut(id) else {
                return;
            };
            let Some(body) = node.body.take() else {
                warn!("Task '{}' ({}) was asked to run twice", node.name, id);
                return;
            };
            node.state = TaskState::Running;
            node.outcome.started_at = Some(Utc::now());
            (
                body,
                node.name.clone(),
                node.token.clone(),
                node.inputs.clone(),
                depends,
                node.preset_previous.clone(),
                node.previous_source.clone(),
                node.start_handlers.clone(),
            )
        };
        let (body, name, token, inputs, depends, preset, source, start_handlers) = prepared;

        debug!(
            "Starting task '{}' ({}) [{}]",
            name,
            id,
            if self.scheduler.in_ui_thread() {
                "UI thread".to_string()
            } else {
                task.affinity().to_string()
            }
        );
        task.update_progress(0, 100, None);
        for handler in start_handlers {
            guarded("start handler", || handler(&task));
        }

        let result = if token.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            let previous_success = inputs
                .success
                .or(depends.as_ref().map(|(success, _)| *success))
                .unwrap_or(true);
            let previous_value = match depends {
                Some((true, Some(value))) => Some(value),
                _ => source.and_then(|source| source()).or(preset),
            };
            let ctx = RunContext {
                task: &task,
                previous_success,
                previous_error: inputs.error,
                previous_value,
                token,
            };
            match catch_unwind(AssertUnwindSafe(|| body(&ctx))) {
                Ok(result) => result.map_err(TaskError::innermost),
                Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
            }
        };

        let error = match result {
            Ok(value) => {
                self.store_outcome(id, false, None, Some(value));
                None
            }
            Err(error) => {
                self.store_outcome(id, true, Some(error.clone()), None);
                Some(error)
            }
        };

        let handled = match &error {
            Some(error) if !error.is_cancelled() => self.raise_catch(id, error),
            _ => false,
        };

        {
            let mut graph = self.lock();
            if let Some(node) = graph.get_mut(id) {
                node.outcome.handled = handled;
                node.outcome.ended_at = Some(Utc::now());
                node.state = TaskState::Completed;
            }
        }

        match &error {
            Some(e) if handled => debug!("Task '{}' ({}) failed, handled: {}", name, id, e),
            Some(e) => debug!("Task '{}' ({}) failed: {}", name, id, e),
            None => debug!("Task '{}' ({}) finished", name, id),
        }
        self.raise_end(id, error.is_none(), error.as_ref());
        task.update_progress(100, 100, None);
        self.setup_continuations(id);
        self.release(id);
    }

    /// Drop the callbacks of a finished task so the closures they captured are freed.
    fn release(&self, id: TaskId) {
        let mut graph = self.lock();
        if let Some(node) = graph.get_mut(id) {
            node.catch_handlers.clear();
            node.finally_handlers.clear();
            node.start_handlers.clear();
            node.end_handlers.clear();
            node.progress_handlers.clear();
            node.data_handlers.clear();
            node.previous_source = None;
            node.preset_previous = None;
        }
    }

    fn store_outcome(
        &self,
        id: TaskId,
        failed: bool,
        error: Option<TaskError>,
        value: Option<TaskValue>,
    ) {
        let mut graph = self.lock();
        if let Some(node) = graph.get_mut(id) {
            node.outcome.has_run = true;
            node.outcome.failed = failed;
            node.outcome.error = error;
            node.outcome.value = value;
        }
    }

    /// Offer `error` to the catch handlers in order; true when one handled it.
    fn raise_catch(&self, id: TaskId, error: &TaskError) -> bool {
        let handlers = self
            .lock()
            .get(id)
            .map(|n| n.catch_handlers.clone())
            .unwrap_or_default();
        for catch in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| (catch.handler)(error)));
            match outcome {
                Ok(CatchOutcome::Handled) => return true,
                Ok(CatchOutcome::Propagate) => {}
                Err(panic) => error!(
                    "Catch handler panicked: {}",
                    panic_message(panic.as_ref())
                ),
            }
        }
        false
    }

    fn raise_end(self: &Arc<Self>, id: TaskId, success: bool, error: Option<&TaskError>) {
        let handlers = self
            .lock()
            .get(id)
            .map(|n| n.end_handlers.clone())
            .unwrap_or_default();
        if handlers.is_empty() {
            return;
        }
        let task = TaskRef::new(Arc::clone(self), id);
        for handler in handlers {
            guarded("end handler", || handler(&task, success, error));
        }
    }

    /// Pick and schedule the next task, or fire the finally handlers when the chain ends here.
    fn setup_continuations(self: &Arc<Self>, id: TaskId) {
        let (next, finals, success, error, value) = {
            let mut graph = self.lock();
            let Some(node) = graph.get(id) else {
                return;
            };
            let ok = node.outcome.continues_as_success();
            let candidates: Vec<TaskId> = if ok {
                node.on_success.or(node.on_always).into_iter().collect()
            } else if let Some(next) = node.on_failure.or(node.on_always) {
                vec![next]
            } else {
                node.fault_handlers.clone()
            };
            let error = node.outcome.error.clone();
            let success = !node.outcome.failed;
            let value = node.outcome.value.clone();
            let finals = node.finally_handlers.clone();

            let mut claimed = Vec::new();
            for candidate in candidates {
                if let Some(next) = graph.get_mut(candidate) {
                    if next.state == TaskState::Created {
                        next.state = TaskState::Scheduled;
                        next.inputs.success = Some(ok);
                        next.inputs.error = if ok { None } else { error.clone() };
                        claimed.push(candidate);
                    }
                }
            }
            (claimed, finals, success, error, value)
        };

        if next.is_empty() {
            for handler in finals {
                guarded("finally handler", || {
                    handler.fire(success, error.as_ref(), value.as_ref())
                });
            }
        } else {
            for task in next {
                self.dispatch(task);
            }
        }
    }

    pub(crate) fn add_finally(&self, id: TaskId, handler: FinallyHandler) {
        let mut graph = self.lock();
        let mut targets = graph.self_and_ancestors(id);
        targets.extend(graph.path_from_end(id, Some(id)));
        graph.add_finally(&targets, &handler);
    }

    pub(crate) fn set_progress(
        &self,
        id: TaskId,
        value: u64,
        total: u64,
        message: Option<String>,
    ) {
        let (snapshot, handlers) = {
            let mut graph = self.lock();
            let Some(node) = graph.get_mut(id) else {
                return;
            };
            node.progress.update(value, total, message);
            (node.progress.clone(), node.progress_handlers.clone())
        };
        for handler in handlers {
            guarded("progress handler", || handler(&snapshot));
        }
    }

    pub(crate) fn progress(&self, id: TaskId) -> Option<Progress> {
        self.lock().get(id).map(|n| n.progress.clone())
    }

    pub(crate) fn raise_data(&self, id: TaskId, data: &(dyn Any + Send + Sync)) {
        let handlers: Vec<DataFn> = self
            .lock()
            .get(id)
            .map(|n| n.data_handlers.clone())
            .unwrap_or_default();
        for handler in handlers {
            guarded("data handler", || handler(data));
        }
    }
}

/// Run an observer callback, logging instead of unwinding into the engine.
fn guarded<F: FnOnce()>(what: &str, f: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        error!("{} panicked: {}", what, panic_message(panic.as_ref()));
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
