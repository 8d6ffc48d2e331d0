//! Result extension trait for logging errors with context.
//!
//! Background loops (executor, scheduler) must not stop on a single failed
//! mutation. They log through these helpers and move on.

use std::fmt::Display;
use tracing::{error, warn};

use crate::error::AppError;

/// Extension trait for logging errors with context.
pub trait ResultExt<T, E> {
    /// Log the error with context if this is an `Err` variant.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use flowrun_executor::result_ext::ResultExt;
    ///
    /// let result: Result<i32, &str> = Err("something went wrong");
    /// let _ = result.log("processing request");
    /// ```
    fn log<S: ToString>(self, context: S) -> Result<T, E>;

    /// Log the error with context and the execution it concerns.
    fn log_for<S: ToString>(self, execution_id: &str, context: S) -> Result<T, E>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let caller_location = std::panic::Location::caller();
            error!(
                target: "flowrun_executor",
                error = %e,
                file = %format!("{}:{}", caller_location.file(), caller_location.line()),
                context = %context.to_string(),
                "Operation failed"
            );
        }
        self
    }

    #[track_caller]
    fn log_for<S: ToString>(self, execution_id: &str, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let caller_location = std::panic::Location::caller();
            error!(
                target: "flowrun_executor",
                error = %e,
                execution_id = %execution_id,
                file = %format!("{}:{}", caller_location.file(), caller_location.line()),
                context = %context.to_string(),
                "Execution operation failed"
            );
        }
        self
    }
}

/// Logging for mutation results where transient failures are expected.
pub trait MutationResultExt<T> {
    /// Log transient failures at warn level and everything else at error level.
    fn log_mutation(self, execution_id: &str, operation: &str) -> Result<T, AppError>;
}

impl<T> MutationResultExt<T> for Result<T, AppError> {
    #[track_caller]
    fn log_mutation(self, execution_id: &str, operation: &str) -> Result<T, AppError> {
        match &self {
            Err(e) if e.is_transient() => {
                warn!(
                    target: "flowrun_executor",
                    error = %e,
                    execution_id = %execution_id,
                    operation = %operation,
                    "Transient mutation failure"
                );
            }
            Err(e) => {
                let caller_location = std::panic::Location::caller();
                error!(
                    target: "flowrun_executor",
                    error = %e,
                    execution_id = %execution_id,
                    operation = %operation,
                    file = %format!("{}:{}", caller_location.file(), caller_location.line()),
                    "Mutation failed"
                );
            }
            Ok(_) => {}
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_ext_ok() {
        let result: Result<i32, &str> = Ok(42);
        let logged = result.log("test context");
        assert_eq!(logged.unwrap(), 42);
    }

    #[test]
    fn test_result_ext_err() {
        let result: Result<i32, &str> = Err("test error");
        let logged = result.log_for("exec-1", "test context");
        assert!(logged.is_err());
    }

    #[test]
    fn test_log_mutation_keeps_error() {
        let result: Result<(), AppError> = Err(AppError::LockTimeout {
            key: "exec-1".to_string(),
        });
        let logged = result.log_mutation("exec-1", "kill");
        assert!(matches!(logged, Err(AppError::LockTimeout { .. })));
    }
}
