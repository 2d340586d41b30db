// ABOUTME: Affinity scheduler mapping task affinities onto execution contexts
// ABOUTME: Runs work on a shared pool behind a reader/writer gate, a UI thread and dedicated threads

use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::affinity::TaskAffinity;
use super::error::{Result, TaskError};

/// A unit of work handed to an execution context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Async worker threads driving process I/O and timers.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Upper bound of pool threads running Concurrent and None work.
    #[serde(default = "default_max_blocking_threads")]
    pub max_blocking_threads: usize,
}

fn default_worker_threads() -> usize {
    thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(2)
}

fn default_max_blocking_threads() -> usize {
    64
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            max_blocking_threads: default_max_blocking_threads(),
        }
    }
}

/// Maps a [`TaskAffinity`] to the place its work runs.
///
/// - `Concurrent` work runs on the shared pool holding the read side of a fair reader/writer gate.
/// - `Exclusive` work runs one item at a time, in submission order, holding the write side.
/// - `Ui` work runs on one dedicated thread in submission order.
/// - `LongRunning` work gets a thread of its own.
/// - `None` work runs on the shared pool without touching the gate.
///
/// Work that blocks on the completion of Exclusive work while holding the read side (a Concurrent
/// body waiting on an Exclusive chain) deadlocks; run such waits from `None` or `LongRunning`.
#[derive(Clone)]
pub struct AffinityScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    gate: Arc<RwLock<()>>,
    exclusive: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    ui: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    ui_thread: ThreadId,
    token: CancellationToken,
    shut_down: AtomicBool,
}

impl AffinityScheduler {
    /// Create a scheduler with its own runtime, exclusive queue and UI thread
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .max_blocking_threads(config.max_blocking_threads.max(1))
            .thread_name("taskchain-pool")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let gate = Arc::new(RwLock::new(()));

        let (exclusive_tx, exclusive_rx) = mpsc::unbounded_channel();
        spawn_queue_thread("taskchain-exclusive", exclusive_rx, Some(Arc::clone(&gate)))?;

        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let ui_thread = spawn_queue_thread("taskchain-ui", ui_rx, None)?;

        info!(
            "Affinity scheduler started ({} workers, {} pool threads)",
            config.worker_threads, config.max_blocking_threads
        );

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                runtime: Mutex::new(Some(runtime)),
                handle,
                gate,
                exclusive: Mutex::new(Some(exclusive_tx)),
                ui: Mutex::new(Some(ui_tx)),
                ui_thread,
                token: CancellationToken::new(),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Hand a job to the execution context of `affinity`. Never blocks the caller.
    pub fn schedule(&self, affinity: TaskAffinity, job: Job) -> Result<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(TaskError::Scheduler(
                "scheduler has been shut down".to_string(),
            ));
        }

        match affinity {
            TaskAffinity::Concurrent => {
                let gate = Arc::clone(&self.inner.gate);
                self.inner.handle.spawn_blocking(move || {
                    let _reader = gate.blocking_read();
                    run_job(job);
                });
            }
            TaskAffinity::None => {
                self.inner.handle.spawn_blocking(move || run_job(job));
            }
            TaskAffinity::Exclusive => send(&self.inner.exclusive, job, "exclusive")?,
            TaskAffinity::Ui => send(&self.inner.ui, job, "ui")?,
            TaskAffinity::LongRunning => {
                thread::Builder::new()
                    .name("taskchain-long-running".to_string())
                    .spawn(move || run_job(job))?;
            }
        }
        Ok(())
    }

    pub fn ui_thread(&self) -> ThreadId {
        self.inner.ui_thread
    }

    pub fn in_ui_thread(&self) -> bool {
        thread::current().id() == self.inner.ui_thread
    }

    /// Cancellation signal shared by every task spawned through this scheduler.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn runtime_handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Drive a future to completion on the calling thread.
    ///
    /// Panics when called from inside an async context; task bodies never are.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.inner.handle.block_on(future)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stop accepting work and release the runtime. Queued exclusive and UI work still drains.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl SchedulerInner {
    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Shutting down affinity scheduler");
        self.exclusive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.ui.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(runtime) = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            runtime.shutdown_background();
        }
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn send(
    queue: &Mutex<Option<mpsc::UnboundedSender<Job>>>,
    job: Job,
    context: &str,
) -> Result<()> {
    let guard = queue.lock().unwrap_or_else(PoisonError::into_inner);
    match guard.as_ref() {
        Some(sender) => sender
            .send(job)
            .map_err(|_| TaskError::Scheduler(format!("{} queue is closed", context))),
        None => Err(TaskError::Scheduler(format!("{} queue is closed", context))),
    }
}

fn spawn_queue_thread(
    name: &str,
    mut receiver: mpsc::UnboundedReceiver<Job>,
    gate: Option<Arc<RwLock<()>>>,
) -> Result<ThreadId> {
    let thread_name = name.to_string();
    let handle = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            while let Some(job) = receiver.blocking_recv() {
                match &gate {
                    Some(gate) => {
                        let _writer = gate.blocking_write();
                        run_job(job);
                    }
                    None => run_job(job),
                }
            }
            debug!("{} thread exiting", thread_name);
        })?;
    Ok(handle.thread().id())
}

fn run_job(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("Scheduled job panicked outside of a task body");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    fn scheduler() -> AffinityScheduler {
        AffinityScheduler::new(&SchedulerConfig {
            worker_threads: 2,
            max_blocking_threads: 8,
        })
        .unwrap()
    }

    #[test]
    fn test_ui_jobs_run_on_ui_thread() {
        let scheduler = scheduler();
        let (tx, rx) = std_mpsc::channel();
        for _ in 0..5 {
            let tx = tx.clone();
            scheduler
                .schedule(
                    TaskAffinity::Ui,
                    Box::new(move || {
                        tx.send(thread::current().id()).unwrap();
                    }),
                )
                .unwrap();
        }
        for _ in 0..5 {
            let id = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(id, scheduler.ui_thread());
        }
        assert!(!scheduler.in_ui_thread());
    }

    #[test]
    fn test_exclusive_jobs_keep_submission_order() {
        let scheduler = scheduler();
        let (tx, rx) = std_mpsc::channel();
        for i in 0..20 {
            let tx = tx.clone();
            scheduler
                .schedule(
                    TaskAffinity::Exclusive,
                    Box::new(move || {
                        tx.send(i).unwrap();
                    }),
                )
                .unwrap();
        }
        let order: Vec<i32> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_exclusive_excludes_concurrent() {
        let scheduler = scheduler();
        let active = Arc::new(AtomicU32::new(0));
        let overlap = Arc::new(AtomicBool::new(false));
        let (tx, rx) = std_mpsc::channel();

        for i in 0..12 {
            let affinity = if i % 3 == 0 {
                TaskAffinity::Exclusive
            } else {
                TaskAffinity::Concurrent
            };
            let active = Arc::clone(&active);
            let overlap = Arc::clone(&overlap);
            let tx = tx.clone();
            scheduler
                .schedule(
                    affinity,
                    Box::new(move || {
                        if affinity == TaskAffinity::Exclusive {
                            if active.fetch_add(100, Ordering::SeqCst) != 0 {
                                overlap.store(true, Ordering::SeqCst);
                            }
                            thread::sleep(Duration::from_millis(20));
                            active.fetch_sub(100, Ordering::SeqCst);
                        } else {
                            if active.fetch_add(1, Ordering::SeqCst) >= 100 {
                                overlap.store(true, Ordering::SeqCst);
                            }
                            thread::sleep(Duration::from_millis(10));
                            active.fetch_sub(1, Ordering::SeqCst);
                        }
                        tx.send(()).unwrap();
                    }),
                )
                .unwrap();
        }

        for _ in 0..12 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(!overlap.load(Ordering::SeqCst));
    }

    #[test]
    fn test_long_running_gets_own_thread() {
        let scheduler = scheduler();
        let (tx, rx) = std_mpsc::channel();
        scheduler
            .schedule(
                TaskAffinity::LongRunning,
                Box::new(move || {
                    tx.send(thread::current().name().map(str::to_string))
                        .unwrap();
                }),
            )
            .unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("taskchain-long-running"));
    }

    #[test]
    fn test_schedule_after_shutdown_fails() {
        let scheduler = scheduler();
        scheduler.shutdown();
        assert!(scheduler.is_shut_down());
        let result = scheduler.schedule(TaskAffinity::Concurrent, Box::new(|| {}));
        assert!(matches!(result, Err(TaskError::Scheduler(_))));
    }

    #[test]
    fn test_config_defaults() {
        let config = SchedulerConfig::default();
        assert!(config.worker_threads >= 1);
        assert_eq!(config.max_blocking_threads, 64);
    }
}
