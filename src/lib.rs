// ABOUTME: Main library module for the taskchain concurrency runtime
// ABOUTME: Exports the task engine, output processors, process tasks and the CLI

pub mod cli;
pub mod engine;
pub mod output;
pub mod process;

// Re-export commonly used types
pub use cli::{App, Args, Config};
pub use engine::{
    AffinityScheduler, CatchOutcome, RunContext, SchedulerConfig, Task, TaskAffinity, TaskError,
    TaskManager, TaskQueue, TaskRunOptions, TaskState,
};
pub use output::OutputProcessor;
pub use process::{
    ProcessError, ProcessManager, ProcessSettings, ProcessStartInfo, ProcessTask, ProcessWrapper,
};

// Error handling
pub type Result<T> = anyhow::Result<T>;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
