//! Error types for the Runway core model.

use thiserror::Error;

/// Errors raised while validating, resolving or evaluating workflow state.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed flow, task, trigger or retry definition.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Expression rendering or condition evaluation failed.
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// A referenced flow, task or task run does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A state change that would move a run backwards.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Invalid cron expression.
    #[error("Cron error: {0}")]
    Cron(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parse error.
    #[error("Parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<cron::error::Error> for CoreError {
    fn from(e: cron::error::Error) -> Self {
        CoreError::Cron(e.to_string())
    }
}

impl From<minijinja::Error> for CoreError {
    fn from(e: minijinja::Error) -> Self {
        CoreError::Evaluation(e.to_string())
    }
}

/// Result type alias using CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
