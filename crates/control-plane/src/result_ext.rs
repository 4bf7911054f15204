//! Logging extensions for `Result` and `Option`.
//!
//! Runners never propagate storage failures out of their loops; they log them
//! with the caller location and move on to the next tick.

use std::fmt::Display;
use tracing::{error, warn};

/// Extension trait for logging errors with context.
pub trait ResultExt<T, E> {
    /// Log the error at `error` level with context and caller location.
    ///
    /// ```ignore
    /// use runway_control_plane::result_ext::ResultExt;
    ///
    /// let saved = repository.save(&execution).await.log("saving execution");
    /// ```
    fn log<S: ToString>(self, context: S) -> Result<T, E>;

    /// Same as [`ResultExt::log`] at `warn` level, for failures the caller retries.
    fn log_warn<S: ToString>(self, context: S) -> Result<T, E>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let location = std::panic::Location::caller();
            error!(
                target: "runway_control_plane",
                error = %e,
                file = %format!("{}:{}", location.file(), location.line()),
                context = %context.to_string(),
                "Operation failed"
            );
        }
        self
    }

    #[track_caller]
    fn log_warn<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let location = std::panic::Location::caller();
            warn!(
                target: "runway_control_plane",
                error = %e,
                file = %format!("{}:{}", location.file(), location.line()),
                context = %context.to_string(),
                "Operation failed, will retry"
            );
        }
        self
    }
}

/// Extension trait for logging a missing value.
pub trait OptionResultExt<T> {
    /// Log at `warn` level if this is `None`.
    fn log_none<S: ToString>(self, context: S) -> Option<T>;
}

impl<T> OptionResultExt<T> for Option<T> {
    #[track_caller]
    fn log_none<S: ToString>(self, context: S) -> Option<T> {
        if self.is_none() {
            let location = std::panic::Location::caller();
            warn!(
                target: "runway_control_plane",
                file = %format!("{}:{}", location.file(), location.line()),
                context = %context.to_string(),
                "Expected value was None"
            );
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    #[test]
    fn test_log_passes_ok_through() {
        let result: Result<i32, AppError> = Ok(42);
        assert_eq!(result.log("loading flow").unwrap(), 42);
    }

    #[test]
    fn test_log_passes_err_through() {
        let result: Result<i32, AppError> = Err(AppError::Queue("closed".to_string()));
        assert!(matches!(result.log_warn("polling"), Err(AppError::Queue(_))));
    }

    #[test]
    fn test_log_none() {
        assert_eq!(Some(1).log_none("flow").unwrap(), 1);
        assert!(None::<i32>.log_none("flow").is_none());
    }
}
