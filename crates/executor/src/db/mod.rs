//! Execution and trigger storage.
//!
//! [`repository`] defines the storage traits, including the locked mutation
//! protocol. [`memory`] implements them in process, [`postgres`] on
//! PostgreSQL with row locks.

pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod queries;
pub mod repository;
pub mod schema;

pub use memory::{MemoryExecutionRepository, MemoryTriggerRepository};
pub use pool::{connect, DbPool};
pub use postgres::{PostgresExecutionRepository, PostgresTriggerRepository};
pub use repository::{
    AdmissionMutation, ExecutionFilter, ExecutionMutation, ExecutionRepository, TriggerClaim,
    TriggerRepository, TriggerState,
};
