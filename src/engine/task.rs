// ABOUTME: Typed task handles and the context handed to running task bodies
// ABOUTME: Provides the fluent then/catch/finally/progress surface and chain queries

use chrono::{DateTime, Utc};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::affinity::{TaskAffinity, TaskRunOptions};
use super::error::TaskError;
use super::graph::{CatchHandler, CatchOutcome, FinallyHandler, TaskId, TaskState, TaskValue};
use super::manager::{ManagerInner, TaskManager};
use super::progress::Progress;
use super::scheduler::AffinityScheduler;

/// Values a task can produce or consume.
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Payload for T {}

/// Untyped handle to a task. Holds the chain queries shared by every task type.
#[derive(Clone)]
pub struct TaskRef {
    pub(crate) manager: Arc<ManagerInner>,
    pub(crate) id: TaskId,
}

/// Handle to a task producing a `T`.
pub struct Task<T> {
    inner: TaskRef,
    _result: PhantomData<fn() -> T>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _result: PhantomData,
        }
    }
}

impl<T> Deref for Task<T> {
    type Target = TaskRef;

    fn deref(&self) -> &TaskRef {
        &self.inner
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("affinity", &self.affinity())
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name(), self.id)
    }
}

/// Everything a task body can see while it runs.
pub struct RunContext<'a> {
    pub(crate) task: &'a TaskRef,
    pub(crate) previous_success: bool,
    pub(crate) previous_error: Option<TaskError>,
    pub(crate) previous_value: Option<TaskValue>,
    pub(crate) token: CancellationToken,
}

impl RunContext<'_> {
    pub fn task(&self) -> &TaskRef {
        self.task
    }

    /// Success flag of the predecessor, or the value it pushed.
    pub fn previous_success(&self) -> bool {
        self.previous_success
    }

    pub fn previous_error(&self) -> Option<&TaskError> {
        self.previous_error.as_ref()
    }

    /// Result of the predecessor when it has type `P`.
    pub fn previous<P: Payload>(&self) -> Option<P> {
        self.previous_value
            .as_ref()
            .and_then(|value| value.downcast_ref::<P>())
            .cloned()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn scheduler(&self) -> &AffinityScheduler {
        self.task.manager.scheduler()
    }

    pub fn report_progress(&self, value: u64, total: u64, message: Option<&str>) {
        self.task
            .update_progress(value, total, message.map(str::to_string));
    }

    /// Hand a data item to the task's `on_data` listeners.
    pub fn raise_data<D: Any + Send + Sync>(&self, data: D) {
        self.task.manager.raise_data(self.task.id, &data);
    }
}

impl TaskRef {
    pub(crate) fn new(manager: Arc<ManagerInner>, id: TaskId) -> Self {
        Self { manager, id }
    }

    fn read<R>(&self, f: impl FnOnce(&super::graph::TaskNode) -> R) -> Option<R> {
        self.manager.lock().get(self.id).map(f)
    }

    fn write(&self, f: impl FnOnce(&mut super::graph::TaskNode)) {
        if let Some(node) = self.manager.lock().get_mut(self.id) {
            f(node);
        }
    }

    fn sibling(&self, id: TaskId) -> TaskRef {
        TaskRef::new(Arc::clone(&self.manager), id)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn manager(&self) -> TaskManager {
        TaskManager {
            inner: Arc::clone(&self.manager),
        }
    }

    pub fn name(&self) -> String {
        self.read(|n| n.name.clone()).unwrap_or_default()
    }

    pub fn affinity(&self) -> TaskAffinity {
        self.read(|n| n.affinity).unwrap_or_default()
    }

    pub fn state(&self) -> TaskState {
        self.read(|n| n.state).unwrap_or(TaskState::Created)
    }

    pub fn message(&self) -> Option<String> {
        self.read(|n| n.message.clone()).flatten()
    }

    pub fn token(&self) -> CancellationToken {
        self.read(|n| n.token.clone())
            .unwrap_or_else(|| self.manager().token())
    }

    pub fn has_run(&self) -> bool {
        self.read(|n| n.outcome.has_run).unwrap_or(false)
    }

    pub fn is_completed(&self) -> bool {
        self.state() == TaskState::Completed
    }

    pub fn successful(&self) -> bool {
        self.read(|n| n.outcome.successful()).unwrap_or(false)
    }

    /// Whether this task's failure was consumed by a catch handler.
    pub fn handled(&self) -> bool {
        self.read(|n| n.outcome.handled).unwrap_or(false)
    }

    /// Error raised by this task, or by the nearest failed task above it.
    pub fn exception(&self) -> Option<TaskError> {
        self.manager
            .lock()
            .failed_in_chain(self.id)
            .map(|(_, error)| error)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.read(|n| n.outcome.started_at).flatten()
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.read(|n| n.outcome.ended_at).flatten()
    }

    pub fn progress_snapshot(&self) -> Progress {
        self.manager
            .progress(self.id)
            .unwrap_or_else(|| Progress::new(self.name()))
    }

    pub fn depends_on(&self) -> Option<TaskRef> {
        self.read(|n| n.depends_on)
            .flatten()
            .map(|id| self.sibling(id))
    }

    /// Earliest task of the chain that has not started yet.
    pub fn top_of_chain(&self) -> Option<TaskRef> {
        let top = self.manager.lock().top_of_chain(self.id);
        top.map(|id| self.sibling(id))
    }

    /// Last task reached by following success and always continuations.
    pub fn end_of_chain(&self) -> TaskRef {
        let end = self.manager.lock().end_of_chain(self.id);
        self.sibling(end)
    }

    /// Whether this task or anything above it requires exclusive execution.
    pub fn is_chain_exclusive(&self) -> bool {
        let graph = self.manager.lock();
        graph
            .self_and_ancestors(self.id)
            .into_iter()
            .any(|id| graph.get(id).map(|n| n.affinity) == Some(TaskAffinity::Exclusive))
    }

    pub fn update_progress(&self, value: u64, total: u64, message: Option<String>) {
        self.manager.set_progress(self.id, value, total, message);
    }

    /// Schedule the earliest unstarted task of this chain.
    pub fn start(&self) {
        self.manager.start(self.id);
    }

    pub(crate) fn set_message(&self, message: impl Into<String>) {
        let message = message.into();
        self.write(|n| n.message = Some(message));
    }

    pub(crate) fn add_catch(
        &self,
        local: bool,
        handler: Arc<dyn Fn(&TaskError) -> CatchOutcome + Send + Sync>,
    ) {
        let catch = CatchHandler {
            id: self.manager.next_handler_id(),
            local,
            handler,
        };
        let mut graph = self.manager.lock();
        let targets = if local {
            vec![self.id]
        } else {
            graph.self_and_ancestors(self.id)
        };
        graph.add_catch(&targets, &catch);
    }

    pub(crate) fn add_finally_inline(
        &self,
        handler: Arc<dyn Fn(bool, Option<&TaskError>, Option<&TaskValue>) + Send + Sync>,
    ) {
        let handler = FinallyHandler::new(self.manager.next_handler_id(), handler);
        self.manager.add_finally(self.id, handler);
    }

    pub(crate) fn add_end(
        &self,
        handler: Arc<dyn Fn(&TaskRef, bool, Option<&TaskError>) + Send + Sync>,
    ) {
        self.write(|n| n.end_handlers.push(handler));
    }

    pub(crate) fn add_progress(&self, handler: Arc<dyn Fn(&Progress) + Send + Sync>) {
        self.write(|n| n.progress_handlers.push(handler));
    }
}

impl<T: Payload> Task<T> {
    pub(crate) fn from_ref(inner: TaskRef) -> Self {
        Self {
            inner,
            _result: PhantomData,
        }
    }

    pub fn named(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.inner.write(|n| {
            n.progress.name = name.clone();
            n.name = name;
        });
        self
    }

    pub fn with_affinity(self, affinity: TaskAffinity) -> Self {
        self.inner.write(|n| n.affinity = affinity);
        self
    }

    /// Observe `token` instead of the manager's.
    pub fn with_token(self, token: CancellationToken) -> Self {
        self.inner.write(|n| n.token = token);
        self
    }

    /// Value handed to the body when no predecessor provides one.
    pub fn with_previous<P: Payload>(self, value: P) -> Self {
        self.inner
            .write(|n| n.preset_previous = Some(Arc::new(value) as TaskValue));
        self
    }

    /// Source queried at run time when no predecessor provides a value.
    pub fn with_previous_source<P, F>(self, source: F) -> Self
    where
        P: Payload,
        F: Fn() -> Option<P> + Send + Sync + 'static,
    {
        self.inner.write(|n| {
            n.previous_source = Some(Arc::new(move || {
                source().map(|value| Arc::new(value) as TaskValue)
            }))
        });
        self
    }

    /// Result of a task that ran successfully.
    pub fn result(&self) -> Option<T> {
        self.inner
            .read(|n| {
                if n.outcome.successful() {
                    n.outcome.value.clone()
                } else {
                    None
                }
            })
            .flatten()
            .and_then(|value| value.downcast_ref::<T>().cloned())
    }

    /// The task's result, its error, or why it never ran.
    pub fn outcome(&self) -> Result<T, TaskError> {
        if let Some(value) = self.result() {
            return Ok(value);
        }
        if let Some(error) = self.inner.read(|n| n.outcome.error.clone()).flatten() {
            return Err(error);
        }
        let failed_above = self.inner.manager.lock().failed_in_chain(self.inner.id);
        match failed_above {
            Some((task, error)) => Err(TaskError::DependentTaskFailed {
                task: self.inner.sibling(task).name(),
                message: error.to_string(),
            }),
            None => Err(TaskError::NotRun {
                task: self.inner.name(),
            }),
        }
    }

    /// Start this chain.
    pub fn start(&self) -> Self {
        self.inner.start();
        self.clone()
    }

    /// Run `next` (and the chain it belongs to) after this task succeeds.
    pub fn then<U: Payload>(&self, next: &Task<U>) -> Task<U> {
        self.then_with(next, TaskRunOptions::OnSuccess)
    }

    pub fn then_with<U: Payload>(&self, next: &Task<U>, options: TaskRunOptions) -> Task<U> {
        self.link(next, options, false)
    }

    /// Wire `next` behind this task. Unless `is_top_of_chain`, `next`'s whole chain is appended.
    ///
    /// # Panics
    ///
    /// Panics when the two tasks belong to different managers.
    pub fn link<U: Payload>(
        &self,
        next: &Task<U>,
        options: TaskRunOptions,
        is_top_of_chain: bool,
    ) -> Task<U> {
        assert!(
            Arc::ptr_eq(&self.inner.manager, &next.inner.manager),
            "cannot chain tasks owned by different task managers"
        );
        self.inner
            .manager
            .link(self.inner.id, next.inner.id, options, is_top_of_chain);
        next.clone()
    }

    pub fn then_action<F>(&self, f: F) -> Task<()>
    where
        F: FnOnce(bool) -> anyhow::Result<()> + Send + 'static,
    {
        let next = self.manager().action(f).with_affinity(self.affinity());
        self.then(&next)
    }

    /// Continue with a function of this task's result.
    pub fn then_func<R, F>(&self, f: F) -> Task<R>
    where
        R: Payload,
        F: FnOnce(bool, Option<T>) -> anyhow::Result<R> + Send + 'static,
    {
        self.then_func_on(self.affinity(), f)
    }

    pub fn then_func_on<R, F>(&self, affinity: TaskAffinity, f: F) -> Task<R>
    where
        R: Payload,
        F: FnOnce(bool, Option<T>) -> anyhow::Result<R> + Send + 'static,
    {
        let next = self
            .manager()
            .func_with_data::<T, R, F>(f)
            .with_affinity(affinity);
        self.then(&next)
    }

    pub fn then_in_ui<R, F>(&self, f: F) -> Task<R>
    where
        R: Payload,
        F: FnOnce(bool, Option<T>) -> anyhow::Result<R> + Send + 'static,
    {
        self.then_func_on(TaskAffinity::Ui, f)
    }

    /// Continue with a future built from this task's result.
    pub fn then_async<R, F, Fut>(&self, f: F) -> Task<R>
    where
        R: Payload,
        F: FnOnce(Option<T>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let next = self
            .manager()
            .create("Async", TaskAffinity::None, move |ctx| {
                let previous = ctx.previous::<T>();
                ctx.scheduler().block_on(f(previous))
            });
        self.then(&next)
    }

    /// Observe failures of this task and everything above it. Never suppresses them.
    pub fn catch<F>(&self, handler: F) -> Self
    where
        F: Fn(&TaskError) + Send + Sync + 'static,
    {
        self.inner.add_catch(
            false,
            Arc::new(move |e: &TaskError| {
                handler(e);
                CatchOutcome::Propagate
            }),
        );
        self.clone()
    }

    /// Observe failures; returning [`CatchOutcome::Handled`] lets success continuations run.
    pub fn catch_with<F>(&self, handler: F) -> Self
    where
        F: Fn(&TaskError) -> CatchOutcome + Send + Sync + 'static,
    {
        self.inner.add_catch(false, Arc::new(handler));
        self.clone()
    }

    /// Run `handler` once, on the thread of whichever task of the chain finishes last.
    pub fn finally_inline<F>(&self, handler: F) -> Self
    where
        F: Fn(bool, Option<&TaskError>, Option<T>) + Send + Sync + 'static,
    {
        self.inner.add_finally_inline(Arc::new(
            move |success: bool, error: Option<&TaskError>, value: Option<&TaskValue>| {
                let value = value.and_then(|v| v.downcast_ref::<T>()).cloned();
                handler(success, error, value)
            },
        ));
        self.clone()
    }

    /// Run `f` after this task whatever its outcome. A failure keeps flowing to the returned task,
    /// whose own catch handles it.
    ///
    /// `f` also runs once the manager has been stopped, and then sees [`TaskError::Cancelled`].
    pub fn finally<F>(&self, f: F) -> Task<()>
    where
        F: FnOnce(bool, Option<&TaskError>) -> anyhow::Result<()> + Send + 'static,
    {
        self.finally_on(TaskAffinity::None, "Finally", f)
    }

    pub fn finally_in_ui<F>(&self, f: F) -> Task<()>
    where
        F: FnOnce(bool, Option<&TaskError>) -> anyhow::Result<()> + Send + 'static,
    {
        self.finally_on(TaskAffinity::Ui, "FinallyInUI", f)
    }

    fn finally_on<F>(&self, affinity: TaskAffinity, name: &str, f: F) -> Task<()>
    where
        F: FnOnce(bool, Option<&TaskError>) -> anyhow::Result<()> + Send + 'static,
    {
        let next = self.manager().create(name, affinity, move |ctx| {
            let success = ctx.previous_success();
            f(success, ctx.previous_error())?;
            if success {
                return Ok(());
            }
            let error = ctx
                .previous_error()
                .cloned()
                .unwrap_or_else(|| TaskError::DependentTaskFailed {
                    task: ctx.task().name(),
                    message: "a previous task failed".to_string(),
                });
            Err(anyhow::Error::new(error))
        });
        // Its own token, so stopping the manager does not skip the handler.
        let next = next.with_token(CancellationToken::new());
        self.then_with(&next, TaskRunOptions::OnAlways);
        next.inner
            .add_catch(true, Arc::new(|_: &TaskError| CatchOutcome::Handled));
        next
    }

    /// Run `f` after this task whatever its outcome and produce a new result from it.
    /// Like [`Task::finally`], `f` still runs once the manager has been stopped.
    pub fn finally_with<R, F>(&self, f: F) -> Task<R>
    where
        R: Payload,
        F: FnOnce(bool, Option<&TaskError>, Option<T>) -> anyhow::Result<R> + Send + 'static,
    {
        let next = self
            .manager()
            .create("Finally", TaskAffinity::None, move |ctx| {
                f(ctx.previous_success(), ctx.previous_error(), ctx.previous::<T>())
            })
            .with_token(CancellationToken::new());
        self.then_with(&next, TaskRunOptions::OnAlways)
    }

    /// Run an existing task after this one whatever its outcome.
    pub fn finally_task<U: Payload>(&self, next: &Task<U>) -> Task<U> {
        self.then_with(next, TaskRunOptions::OnAlways)
    }

    pub fn progress<F>(&self, handler: F) -> Self
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        self.inner.add_progress(Arc::new(handler));
        self.clone()
    }

    pub fn on_start<F>(&self, handler: F) -> Self
    where
        F: Fn(&TaskRef) + Send + Sync + 'static,
    {
        self.inner.write(|n| n.start_handlers.push(Arc::new(handler)));
        self.clone()
    }

    pub fn on_end<F>(&self, handler: F) -> Self
    where
        F: Fn(&TaskRef, bool, Option<&TaskError>) + Send + Sync + 'static,
    {
        self.inner.add_end(Arc::new(handler));
        self.clone()
    }

    /// Listen for data items of type `D` raised while the task runs.
    pub fn on_data<D, F>(&self, handler: F) -> Self
    where
        D: Any + Send + Sync,
        F: Fn(&D) + Send + Sync + 'static,
    {
        self.inner.write(|n| {
            n.data_handlers
                .push(Arc::new(move |data: &(dyn Any + Send + Sync)| {
                    if let Some(data) = data.downcast_ref::<D>() {
                        handler(data);
                    }
                }))
        });
        self.clone()
    }
}
