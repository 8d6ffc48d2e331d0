//! Error types for the flowrun executor.
//!
//! This module provides the error taxonomy of the mutation engine. Every
//! variant implements `IntoResponse` so handlers can return it directly.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::engine::state::StateType;

/// Application-level errors for the executor.
#[derive(Error, Debug)]
pub enum AppError {
    /// Operation not valid from the current state (never retried)
    #[error("Invalid state for execution '{execution_id}'{}: actual {actual}, attempted {attempted}", task_run_suffix(.task_run_id))]
    InvalidState {
        execution_id: String,
        task_run_id: Option<String>,
        actual: StateType,
        attempted: String,
    },

    /// Referenced execution, task run, flow or revision absent
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Storage reported a write conflict despite the row lock
    #[error("Concurrent modification of execution '{execution_id}'")]
    ConcurrentModification { execution_id: String },

    /// Lock could not be acquired within the storage bound
    #[error("Lock timeout on '{key}'")]
    LockTimeout { key: String },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Bad request error
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Parse error (YAML flow definitions)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// NATS messaging error
    #[error("NATS error: {0}")]
    Nats(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn task_run_suffix(task_run_id: &Option<String>) -> String {
    match task_run_id {
        Some(id) => format!(", task run '{}'", id),
        None => String::new(),
    }
}

impl AppError {
    /// Build an `InvalidState` error for an execution-level operation.
    pub fn invalid_state(
        execution_id: impl Into<String>,
        actual: StateType,
        attempted: impl ToString,
    ) -> Self {
        AppError::InvalidState {
            execution_id: execution_id.into(),
            task_run_id: None,
            actual,
            attempted: attempted.to_string(),
        }
    }

    /// Build an `InvalidState` error scoped to a task run.
    pub fn invalid_task_run_state(
        execution_id: impl Into<String>,
        task_run_id: impl Into<String>,
        actual: StateType,
        attempted: impl ToString,
    ) -> Self {
        AppError::InvalidState {
            execution_id: execution_id.into(),
            task_run_id: Some(task_run_id.into()),
            actual,
            attempted: attempted.to_string(),
        }
    }

    /// Whether the caller may retry the operation as is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::LockTimeout { .. } | AppError::ConcurrentModification { .. }
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::InvalidState { .. } => (StatusCode::CONFLICT, self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::ConcurrentModification { .. } => {
                tracing::warn!(error = %self, "Concurrent modification");
                (StatusCode::CONFLICT, self.to_string())
            }
            AppError::LockTimeout { .. } => {
                tracing::warn!(error = %self, "Lock timeout");
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            AppError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::Serialization(e) => {
                tracing::error!(error = %e, "Serialization error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::Parse(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Config(msg) => {
                tracing::error!(error = %msg, "Configuration error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
            AppError::Nats(msg) => {
                tracing::error!(error = %msg, "NATS error");
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone())
            }
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<envy::Error> for AppError {
    fn from(err: envy::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = AppError::NotFound("task run 'abc'".to_string());
        assert_eq!(err.to_string(), "Resource not found: task run 'abc'");
    }

    #[test]
    fn test_invalid_state_message_carries_ids() {
        let err = AppError::invalid_task_run_state("exec-1", "tr-1", StateType::Running, "restart");
        assert_eq!(
            err.to_string(),
            "Invalid state for execution 'exec-1', task run 'tr-1': actual RUNNING, attempted restart"
        );

        let err = AppError::invalid_state("exec-1", StateType::Success, StateType::Paused);
        assert_eq!(
            err.to_string(),
            "Invalid state for execution 'exec-1': actual SUCCESS, attempted PAUSED"
        );
    }

    #[test]
    fn test_transient_errors() {
        assert!(AppError::LockTimeout { key: "x".into() }.is_transient());
        assert!(AppError::ConcurrentModification { execution_id: "x".into() }.is_transient());
        assert!(!AppError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn test_invalid_state_maps_to_conflict() {
        let response = AppError::invalid_state("e", StateType::Running, "restart").into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = AppError::LockTimeout { key: "e".into() }.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
