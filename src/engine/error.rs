// ABOUTME: Error taxonomy shared by every task in a chain
// ABOUTME: Defines TaskError, normalisation of user faults and the engine Result alias

use std::sync::Arc;
use thiserror::Error;

use crate::process::ProcessError;

/// Errors that flow through a task chain.
///
/// Every variant is cheap to clone because the same error is handed to catch handlers, finally
/// handlers, waiters and queues.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("{0}")]
    Faulted(Arc<anyhow::Error>),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Dependent task '{task}' failed: {message}")]
    DependentTaskFailed { task: String, message: String },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Task was cancelled")]
    Cancelled,

    #[error("{}", join_messages(.0))]
    Aggregate(Vec<TaskError>),

    #[error("Task '{task}' did not run")]
    NotRun { task: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

pub type Result<T> = std::result::Result<T, TaskError>;

fn join_messages(errors: &[TaskError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl From<std::io::Error> for TaskError {
    fn from(error: std::io::Error) -> Self {
        TaskError::Io(Arc::new(error))
    }
}

impl TaskError {
    /// Convert an error returned by user code into the chain's taxonomy.
    ///
    /// Errors that already are `TaskError`/`ProcessError` keep their identity, so a finally task
    /// that rethrows the incoming error hands the very same error downstream.
    pub fn from_fault(error: anyhow::Error) -> Self {
        let error = match error.downcast::<TaskError>() {
            Ok(task_error) => return task_error.innermost(),
            Err(other) => other,
        };
        match error.downcast::<ProcessError>() {
            Ok(process_error) => TaskError::from(process_error).innermost(),
            Err(other) => TaskError::Faulted(Arc::new(other)),
        }
    }

    /// Unwrap single-element aggregates down to the error they carry.
    pub fn innermost(self) -> Self {
        match self {
            TaskError::Aggregate(mut errors) if errors.len() == 1 => {
                errors.remove(0).innermost()
            }
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }

    /// The process error carried by this error, if any.
    pub fn as_process_error(&self) -> Option<&ProcessError> {
        match self {
            TaskError::Process(error) => Some(error),
            _ => None,
        }
    }

    /// Try to view a user fault as a concrete error type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            TaskError::Faulted(error) => error.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Errors held by an aggregate, or this error alone.
    pub fn errors(&self) -> Vec<&TaskError> {
        match self {
            TaskError::Aggregate(errors) => errors.iter().collect(),
            other => vec![other],
        }
    }
}
