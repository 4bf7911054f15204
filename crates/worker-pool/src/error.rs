//! Task execution error types.

use runway_core::CoreError;
use thiserror::Error;

/// Errors that end a task attempt.
#[derive(Debug, Error)]
pub enum TaskError {
    /// No task registered under this type.
    #[error("Task type not found: {0}")]
    NotFound(String),

    /// Task ran and reported a failure.
    #[error("Task failed: {0}")]
    Failed(String),

    /// A property template could not be rendered.
    #[error("Render error: {0}")]
    Render(#[from] CoreError),

    /// Attempt exceeded the task timeout.
    #[error("Task timed out after {0} seconds")]
    Timeout(u64),

    /// Missing or malformed task property.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TaskError {
    /// Whether another attempt could succeed. Unknown types and bad
    /// properties fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Failed(_) | TaskError::Timeout(_))
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        TaskError::Failed(e.to_string())
    }
}
