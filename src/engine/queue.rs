// ABOUTME: Aggregate task that starts a set of member tasks and completes when all of them end
// ABOUTME: Converts member results into one list or fails with the union of member errors

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use tracing::debug;

use super::affinity::TaskAffinity;
use super::error::{Result, TaskError};
use super::graph::{TaskId, TaskValue};
use super::manager::TaskManager;
use super::progress::Progress;
use super::task::{Payload, Task, TaskRef};

type Converter<T, R> = Arc<dyn Fn(T) -> anyhow::Result<R> + Send + Sync>;

/// A task whose result is the list of its members' results.
///
/// Starting the queue starts every member. The queue completes once every member has ended; it
/// succeeds only when all of them succeeded.
pub struct TaskQueue<T, R> {
    task: Task<Vec<R>>,
    state: Arc<QueueState<T>>,
}

struct QueueState<T> {
    members: Mutex<Vec<Task<T>>>,
    finished: Mutex<HashSet<TaskId>>,
    errors: Mutex<HashMap<TaskId, TaskError>>,
    done: Condvar,
}

impl<T: Payload> QueueState<T> {
    fn finish(&self, id: TaskId) {
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        if finished.insert(id) {
            self.done.notify_all();
        }
    }

    fn members(&self) -> Vec<Task<T>> {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn wait_for(&self, count: usize) {
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        while finished.len() < count {
            finished = self
                .done
                .wait(finished)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl<T: Payload, R: Payload> TaskQueue<T, R> {
    /// A queue passing member results through unchanged.
    ///
    /// Fails with [`TaskError::InvalidArgument`] when `T` and `R` differ; use
    /// [`TaskQueue::with_converter`] for those.
    pub fn new(manager: &TaskManager) -> Result<Self> {
        if TypeId::of::<T>() != TypeId::of::<R>() {
            return Err(TaskError::InvalidArgument(format!(
                "a converter is required to turn {} into {}",
                std::any::type_name::<T>(),
                std::any::type_name::<R>()
            )));
        }
        Ok(Self::with_converter(manager, |value: T| {
            let boxed: Box<dyn Any> = Box::new(value);
            boxed
                .downcast::<R>()
                .map(|value| *value)
                .map_err(|_| anyhow::anyhow!("queue result has an unexpected type"))
        }))
    }

    pub fn with_converter<F>(manager: &TaskManager, converter: F) -> Self
    where
        F: Fn(T) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let converter: Converter<T, R> = Arc::new(converter);
        let state = Arc::new(QueueState {
            members: Mutex::new(Vec::new()),
            finished: Mutex::new(HashSet::new()),
            errors: Mutex::new(HashMap::new()),
            done: Condvar::new(),
        });

        let body_state = Arc::clone(&state);
        let task = manager.create("Queue", TaskAffinity::LongRunning, move |ctx| {
            let members = body_state.members();
            if members.is_empty() {
                return Ok(Vec::new());
            }
            debug!("Queue {} starting {} tasks", ctx.task().id(), members.len());
            for member in &members {
                member.start();
            }
            body_state.wait_for(members.len());

            let recorded = body_state
                .errors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let errors: Vec<TaskError> = members
                .iter()
                .filter(|member| !member.successful())
                .map(|member| {
                    recorded
                        .get(&member.id())
                        .cloned()
                        .or_else(|| member.exception())
                        .unwrap_or_else(|| TaskError::NotRun {
                            task: member.name(),
                        })
                })
                .collect();
            if !errors.is_empty() {
                return Err(anyhow::Error::new(TaskError::Aggregate(errors)));
            }

            members
                .iter()
                .map(|member| {
                    let value = member.result().ok_or_else(|| TaskError::NotRun {
                        task: member.name(),
                    })?;
                    converter(value)
                })
                .collect::<anyhow::Result<Vec<R>>>()
        });

        Self { task, state }
    }

    /// Add `member` to the queue. Members must be added before the queue starts.
    pub fn queue(&self, member: &Task<T>) -> Task<T> {
        let id = member.id();

        let on_end = Arc::clone(&self.state);
        member.on_end(move |task, _, _| on_end.finish(task.id()));

        let on_error = Arc::clone(&self.state);
        member.catch(move |error| {
            on_error
                .errors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(id)
                .or_insert_with(|| error.clone());
        });

        let on_settled = Arc::clone(&self.state);
        member.add_finally_inline(Arc::new(
            move |_: bool, _: Option<&TaskError>, _: Option<&TaskValue>| on_settled.finish(id),
        ));

        let on_progress = Arc::clone(&self.state);
        let queue = TaskRef::clone(&self.task);
        member.progress(move |_| {
            let members = on_progress.members();
            let snapshots: Vec<Progress> =
                members.iter().map(|m| m.progress_snapshot()).collect();
            let combined = Progress::combine(&queue.name(), &snapshots);
            queue.update_progress(combined.value, combined.total, None);
        });

        self.state
            .members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(member.clone());
        member.clone()
    }

    pub fn len(&self) -> usize {
        self.state
            .members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The task representing the whole queue.
    pub fn task(&self) -> &Task<Vec<R>> {
        &self.task
    }
}

impl<T, R> TaskQueue<T, R>
where
    T: Payload + Into<R>,
    R: Payload,
{
    /// A queue converting member results with `Into`.
    pub fn converting(manager: &TaskManager) -> Self {
        Self::with_converter(manager, |value: T| Ok(value.into()))
    }
}

impl<T, R> Deref for TaskQueue<T, R> {
    type Target = Task<Vec<R>>;

    fn deref(&self) -> &Task<Vec<R>> {
        &self.task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SchedulerConfig;

    fn manager() -> TaskManager {
        TaskManager::new(&SchedulerConfig {
            worker_threads: 2,
            max_blocking_threads: 8,
        })
        .unwrap()
    }

    #[test]
    fn test_mismatched_types_need_converter() {
        let manager = manager();
        let result = TaskQueue::<u32, String>::new(&manager);
        assert!(matches!(result, Err(TaskError::InvalidArgument(_))));
        assert!(TaskQueue::<u32, u32>::new(&manager).is_ok());
    }

    #[test]
    fn test_empty_queue_completes() {
        let manager = manager();
        let queue = TaskQueue::<u32, u32>::new(&manager).unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.start_and_wait().unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_results_keep_member_order() {
        let manager = manager();
        let queue = TaskQueue::<u32, u64>::converting(&manager);
        for i in 0..5u32 {
            queue.queue(&manager.func(move |_| {
                std::thread::sleep(std::time::Duration::from_millis(u64::from(5 - i) * 5));
                Ok(i)
            }));
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.start_and_wait().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
