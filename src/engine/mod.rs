// ABOUTME: Task-chain engine module for the taskchain runtime
// ABOUTME: Handles chaining, continuation routing, affinity scheduling and task aggregation

pub mod affinity;
pub mod error;
pub mod graph;
pub mod manager;
pub mod progress;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod wait;

pub use affinity::{TaskAffinity, TaskRunOptions};
pub use error::{Result, TaskError};
pub use graph::{CatchOutcome, TaskId, TaskState, TaskValue};
pub use manager::TaskManager;
pub use progress::Progress;
pub use queue::TaskQueue;
pub use scheduler::{AffinityScheduler, Job, SchedulerConfig};
pub use task::{Payload, RunContext, Task, TaskRef};
