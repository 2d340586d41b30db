// ABOUTME: Error types raised while launching and supervising external processes
// ABOUTME: Carries exit codes and captured stderr so callers can report them

use thiserror::Error;

/// Exit code reported when the OS gives no code for a launch failure.
pub const UNKNOWN_LAUNCH_CODE: i32 = -42;

/// Exit code reported for a process stopped by a timeout.
pub const TIMED_OUT_CODE: i32 = -2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error("{message}")]
    Launch { code: i32, message: String },

    #[error("Process timed out")]
    TimedOut,

    #[error("{message}")]
    Exited { code: i32, message: String },

    #[error("Process was cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ProcessError>;

impl ProcessError {
    pub fn error_code(&self) -> i32 {
        match self {
            ProcessError::Launch { code, .. } | ProcessError::Exited { code, .. } => *code,
            ProcessError::TimedOut => TIMED_OUT_CODE,
            ProcessError::Cancelled => 0,
        }
    }

    /// Failure for a process that exited with `code`, described by its stderr lines.
    pub fn exited(code: i32, errors: &[String]) -> Self {
        let message = if errors.is_empty() {
            format!("Process exited with code {}", code)
        } else {
            errors.join("\n")
        };
        ProcessError::Exited { code, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exited_joins_stderr() {
        let error = ProcessError::exited(137, &["boom".to_string(), "again".to_string()]);
        assert_eq!(error.to_string(), "boom\nagain");
        assert_eq!(error.error_code(), 137);
    }

    #[test]
    fn test_exited_without_stderr() {
        let error = ProcessError::exited(3, &[]);
        assert_eq!(error.to_string(), "Process exited with code 3");
    }

    #[test]
    fn test_timeout_code() {
        assert_eq!(ProcessError::TimedOut.error_code(), TIMED_OUT_CODE);
    }
}
