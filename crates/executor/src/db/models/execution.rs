//! Execution row model.
//!
//! The execution is stored whole as JSONB; the scalar columns next to it
//! exist for filtering and locking.

use sqlx::types::Json;
use sqlx::FromRow;

use crate::engine::execution::{Execution, ExecutorState};

/// Row of the `executions` table as read back by the repository.
#[derive(Debug, Clone, FromRow)]
pub struct ExecutionRow {
    pub id: String,
    pub value: Json<Execution>,
    pub executor_state: Json<ExecutorState>,
}

impl ExecutionRow {
    pub fn into_parts(self) -> (Execution, ExecutorState) {
        (self.value.0, self.executor_state.0)
    }

    pub fn into_execution(self) -> Execution {
        self.value.0
    }
}
