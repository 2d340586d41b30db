// ABOUTME: Arena of task records keyed by stable ids
// ABOUTME: Holds node state, graph edges, handler lists and the traversal helpers the engine needs

use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::affinity::TaskAffinity;
use super::error::TaskError;
use super::progress::Progress;
use super::task::{RunContext, TaskRef};

/// Stable identity of a task inside its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Scheduled,
    Running,
    Completed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Created => write!(f, "created"),
            TaskState::Scheduled => write!(f, "scheduled"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
        }
    }
}

/// Result returned by a catch handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchOutcome {
    /// The error is consumed; success continuations run.
    Handled,
    /// The error keeps propagating to later handlers and failure paths.
    Propagate,
}

/// Type-erased result value held by a task.
pub type TaskValue = Arc<dyn Any + Send + Sync>;

pub(crate) type Body =
    Box<dyn FnOnce(&RunContext<'_>) -> Result<TaskValue, TaskError> + Send + 'static>;
pub(crate) type CatchFn = Arc<dyn Fn(&TaskError) -> CatchOutcome + Send + Sync>;
pub(crate) type FinallyFn = Arc<dyn Fn(bool, Option<&TaskError>, Option<&TaskValue>) + Send + Sync>;
pub(crate) type StartFn = Arc<dyn Fn(&TaskRef) + Send + Sync>;
pub(crate) type EndFn = Arc<dyn Fn(&TaskRef, bool, Option<&TaskError>) + Send + Sync>;
pub(crate) type ProgressFn = Arc<dyn Fn(&Progress) + Send + Sync>;
pub(crate) type DataFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;
pub(crate) type PreviousSource = Arc<dyn Fn() -> Option<TaskValue> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct CatchHandler {
    pub id: u64,
    /// Local handlers stay on the task they were registered on.
    pub local: bool,
    pub handler: CatchFn,
}

#[derive(Clone)]
pub(crate) struct FinallyHandler {
    pub id: u64,
    fired: Arc<AtomicBool>,
    handler: FinallyFn,
}

impl FinallyHandler {
    pub fn new(id: u64, handler: FinallyFn) -> Self {
        Self {
            id,
            fired: Arc::new(AtomicBool::new(false)),
            handler,
        }
    }

    /// Invoke the handler unless some task of the chain already did.
    pub fn fire(&self, success: bool, error: Option<&TaskError>, value: Option<&TaskValue>) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            (self.handler)(success, error, value);
        }
    }
}

/// What the task that scheduled this one handed over.
#[derive(Clone, Default)]
pub(crate) struct Inputs {
    pub success: Option<bool>,
    pub error: Option<TaskError>,
}

#[derive(Default)]
pub(crate) struct Outcome {
    pub has_run: bool,
    pub failed: bool,
    pub handled: bool,
    pub error: Option<TaskError>,
    pub value: Option<TaskValue>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Outcome {
    pub fn successful(&self) -> bool {
        self.has_run && !self.failed
    }

    /// Whether continuations see this task as having succeeded.
    pub fn continues_as_success(&self) -> bool {
        !self.failed || self.handled
    }
}

pub(crate) struct TaskNode {
    pub name: String,
    pub affinity: TaskAffinity,
    pub state: TaskState,
    pub token: CancellationToken,
    pub message: Option<String>,

    pub depends_on: Option<TaskId>,
    pub on_success: Option<TaskId>,
    pub on_failure: Option<TaskId>,
    pub on_always: Option<TaskId>,
    pub fault_handlers: Vec<TaskId>,

    pub catch_handlers: Vec<CatchHandler>,
    pub finally_handlers: Vec<FinallyHandler>,
    pub start_handlers: Vec<StartFn>,
    pub end_handlers: Vec<EndFn>,
    pub progress_handlers: Vec<ProgressFn>,
    pub data_handlers: Vec<DataFn>,

    pub body: Option<Body>,
    pub inputs: Inputs,
    pub preset_previous: Option<TaskValue>,
    pub previous_source: Option<PreviousSource>,
    pub progress: Progress,
    pub outcome: Outcome,
}

impl TaskNode {
    pub fn new(name: String, affinity: TaskAffinity, token: CancellationToken, body: Body) -> Self {
        Self {
            progress: Progress::new(name.clone()),
            name,
            affinity,
            state: TaskState::Created,
            token,
            message: None,
            depends_on: None,
            on_success: None,
            on_failure: None,
            on_always: None,
            fault_handlers: Vec::new(),
            catch_handlers: Vec::new(),
            finally_handlers: Vec::new(),
            start_handlers: Vec::new(),
            end_handlers: Vec::new(),
            progress_handlers: Vec::new(),
            data_handlers: Vec::new(),
            body: Some(body),
            inputs: Inputs::default(),
            preset_previous: None,
            previous_source: None,
            outcome: Outcome::default(),
        }
    }
}

#[derive(Default)]
pub(crate) struct TaskGraph {
    nodes: HashMap<TaskId, TaskNode>,
    next_id: u64,
}

impl TaskGraph {
    pub fn insert(&mut self, node: TaskNode) -> TaskId {
        self.next_id += 1;
        let id = TaskId(self.next_id);
        self.nodes.insert(id, node);
        id
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut TaskNode> {
        self.nodes.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Ancestors of `id`, nearest first. Stops if a cycle is ever detected.
    pub fn ancestors(&self, id: TaskId) -> Vec<TaskId> {
        let mut chain = Vec::new();
        let mut current = self.get(id).and_then(|n| n.depends_on);
        while let Some(ancestor) = current {
            if ancestor == id || chain.contains(&ancestor) {
                break;
            }
            chain.push(ancestor);
            current = self.get(ancestor).and_then(|n| n.depends_on);
        }
        chain
    }

    /// `id` followed by its ancestors.
    pub fn self_and_ancestors(&self, id: TaskId) -> Vec<TaskId> {
        let mut chain = vec![id];
        chain.extend(self.ancestors(id));
        chain
    }

    pub fn root(&self, id: TaskId) -> TaskId {
        self.ancestors(id).last().copied().unwrap_or(id)
    }

    /// Follow success, then always, edges to the last task of the chain.
    pub fn end_of_chain(&self, id: TaskId) -> TaskId {
        let mut visited = vec![id];
        let mut current = id;
        while let Some(next) = self
            .get(current)
            .and_then(|n| n.on_success.or(n.on_always))
        {
            if visited.contains(&next) {
                break;
            }
            visited.push(next);
            current = next;
        }
        current
    }

    /// Tasks from the end of `id`'s chain back up to, but excluding, `stop`.
    pub fn path_from_end(&self, id: TaskId, stop: Option<TaskId>) -> Vec<TaskId> {
        let mut path = Vec::new();
        let mut current = Some(self.end_of_chain(id));
        while let Some(task) = current {
            if Some(task) == stop || path.contains(&task) {
                break;
            }
            path.push(task);
            current = self.get(task).and_then(|n| n.depends_on);
        }
        path
    }

    /// Topmost task still in `Created`, or `None` when even that is absent.
    pub fn top_of_chain(&self, id: TaskId) -> Option<TaskId> {
        self.self_and_ancestors(id)
            .into_iter()
            .filter(|task| {
                self.get(*task)
                    .map(|n| n.state == TaskState::Created)
                    .unwrap_or(false)
            })
            .last()
    }

    /// The task `start()` should schedule: the root if it has not started yet.
    pub fn top_most_startable(&self, id: TaskId) -> Option<TaskId> {
        let root = self.root(id);
        match self.get(root) {
            Some(node) if node.state == TaskState::Created => self.top_of_chain(id),
            _ => None,
        }
    }

    /// Nearest task at or above `id` that failed, with its error.
    pub fn failed_in_chain(&self, id: TaskId) -> Option<(TaskId, TaskError)> {
        self.self_and_ancestors(id).into_iter().find_map(|task| {
            let node = self.get(task)?;
            if node.outcome.failed {
                node.outcome.error.clone().map(|e| (task, e))
            } else {
                None
            }
        })
    }

    pub fn add_catch(&mut self, ids: &[TaskId], handler: &CatchHandler) {
        for id in ids {
            if let Some(node) = self.get_mut(*id) {
                if !node.catch_handlers.iter().any(|h| h.id == handler.id) {
                    node.catch_handlers.push(handler.clone());
                }
            }
        }
    }

    pub fn add_finally(&mut self, ids: &[TaskId], handler: &FinallyHandler) {
        for id in ids {
            if let Some(node) = self.get_mut(*id) {
                if !node.finally_handlers.iter().any(|h| h.id == handler.id) {
                    node.finally_handlers.push(handler.clone());
                }
            }
        }
    }

    /// Register `handler` as the failure route of `id` and all of its ancestors.
    pub fn add_fault_handler(&mut self, id: TaskId, handler: TaskId) {
        for task in self.self_and_ancestors(id) {
            if task == handler {
                continue;
            }
            if let Some(node) = self.get_mut(task) {
                if !node.fault_handlers.contains(&handler) {
                    node.fault_handlers.push(handler);
                }
            }
        }
    }
}
