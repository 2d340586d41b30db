// ABOUTME: Adapters for awaiting a task chain from async or blocking code
// ABOUTME: Completes a oneshot channel from whichever of the catch or finally hooks fires first

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::oneshot;

use super::error::TaskError;
use super::graph::{TaskId, TaskValue};
use super::manager::ManagerInner;
use super::task::{Payload, Task};

type Slot<T> = Arc<Mutex<Option<oneshot::Sender<Result<T, TaskError>>>>>;

fn complete<T>(slot: &Slot<T>, result: Result<T, TaskError>) {
    let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(sender) = sender {
        let _ = sender.send(result);
    }
}

/// Own result of `id` when it succeeded and holds a `T`.
fn own_result<T: Payload>(manager: &Weak<ManagerInner>, id: TaskId) -> Option<T> {
    let manager = manager.upgrade()?;
    let graph = manager.lock();
    let node = graph.get(id)?;
    if !node.outcome.successful() {
        return None;
    }
    node.outcome
        .value
        .as_ref()
        .and_then(|value| value.downcast_ref::<T>())
        .cloned()
}

impl<T: Payload + Default> Task<T> {
    fn register_waiter(&self) -> oneshot::Receiver<Result<T, TaskError>> {
        let (sender, receiver) = oneshot::channel();
        let slot: Slot<T> = Arc::new(Mutex::new(Some(sender)));

        let on_error = Arc::clone(&slot);
        self.catch(move |error| complete(&on_error, Err(error.clone())));

        let on_finally = Arc::clone(&slot);
        let manager = Arc::downgrade(&self.manager);
        let id = self.id;
        self.add_finally_inline(Arc::new(
            move |success: bool, error: Option<&TaskError>, value: Option<&TaskValue>| {
                let result = if success {
                    let value = value
                        .and_then(|v| v.downcast_ref::<T>())
                        .cloned()
                        .or_else(|| own_result::<T>(&manager, id));
                    Ok(value.unwrap_or_default())
                } else {
                    Err(error.cloned().unwrap_or_else(|| TaskError::NotRun {
                        task: id.to_string(),
                    }))
                };
                complete(&on_finally, result);
            },
        ));

        if self.is_completed() {
            complete(&slot, self.outcome());
        }
        receiver
    }

    /// Start the chain and resolve with this task's result once the chain settles.
    ///
    /// Resolves with `T::default()` when the chain ends successfully without this task producing
    /// a value, as with a detached process.
    pub fn start_as_async(&self) -> impl Future<Output = Result<T, TaskError>> + Send + 'static {
        let receiver = self.register_waiter();
        let name = self.name();
        self.start();
        async move {
            receiver
                .await
                .unwrap_or(Err(TaskError::NotRun { task: name }))
        }
    }

    /// Blocking form of [`Task::start_as_async`].
    ///
    /// Must not be called from an async context, nor from a thread the chain needs to make
    /// progress (the UI thread when the chain has UI tasks).
    pub fn start_and_wait(&self) -> Result<T, TaskError> {
        let receiver = self.register_waiter();
        self.start();
        receiver.blocking_recv().unwrap_or_else(|_| {
            Err(TaskError::NotRun {
                task: self.name(),
            })
        })
    }

    /// Start the chain and map a failure to a value with `handler`.
    pub fn start_await<F>(&self, handler: F) -> impl Future<Output = T> + Send + 'static
    where
        F: FnOnce(TaskError) -> T + Send + 'static,
    {
        let future = self.start_as_async();
        async move {
            match future.await {
                Ok(value) => value,
                Err(error) => handler(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::{SchedulerConfig, TaskError, TaskManager};

    fn manager() -> TaskManager {
        TaskManager::new(&SchedulerConfig {
            worker_threads: 2,
            max_blocking_threads: 8,
        })
        .unwrap()
    }

    #[test]
    fn test_start_and_wait_returns_value() {
        let manager = manager();
        let task = manager.func(|_| Ok(42u32));
        assert_eq!(task.start_and_wait().unwrap(), 42);
    }

    #[test]
    fn test_late_waiter_resolves_immediately() {
        let manager = manager();
        let task = manager.func(|_| Ok("done".to_string()));
        assert_eq!(task.start_and_wait().unwrap(), "done");
        assert_eq!(task.start_and_wait().unwrap(), "done");
    }

    #[tokio::test]
    async fn test_start_as_async_reports_failure() {
        let manager = manager();
        let task = manager.func(|_| -> anyhow::Result<u32> { anyhow::bail!("nope") });
        let error = task.start_as_async().await.unwrap_err();
        assert_eq!(error.to_string(), "nope");
        assert!(matches!(error, TaskError::Faulted(_)));
    }

    #[tokio::test]
    async fn test_start_await_maps_error() {
        let manager = manager();
        let task = manager.func(|_| -> anyhow::Result<i32> { anyhow::bail!("nope") });
        let value = task.start_await(|_| -1).await;
        assert_eq!(value, -1);
    }
}
