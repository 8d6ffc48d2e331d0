//! flowrun executor library
//!
//! Execution state machine and locked mutation engine for flow executions:
//!
//! - **Mutations**: restart, replay, force a task run state, kill, resume,
//!   delete and purge executions
//! - **Concurrency**: per-flow admission limits with cancel, fail or queue
//!   policies
//! - **Orchestration**: worker reports folded into executions, next task
//!   runs resolved and dispatched
//! - **Triggers**: schedules and flow-completion triggers
//!
//! ## Architecture
//!
//! Every change to a stored execution is a pure function applied under an
//! exclusive per-execution lock, persisted, then published on the execution
//! queue. Storage is in memory or PostgreSQL (`SELECT ... FOR UPDATE`);
//! queues are in memory or NATS JetStream.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`db`]: Storage traits and their memory and PostgreSQL implementations
//! - [`engine`]: States, task runs, resets and the orchestrator
//! - [`error`]: Custom error types with Axum integration
//! - [`flow`]: Flow definitions and the revisioned flow registry
//! - [`handlers`]: HTTP route handlers
//! - [`queue`]: Execution and worker job queues
//! - [`services`]: Execution service, executor, concurrency and scheduler
//! - [`state`]: Shared application state
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use flowrun_executor::{
//!     config::AppConfig,
//!     db::MemoryExecutionRepository,
//!     engine::DefaultConditionEvaluator,
//!     flow::FlowRepository,
//!     handlers,
//!     queue::MemoryQueue,
//!     state::AppState,
//! };
//!
//! let config = AppConfig::default();
//! let state = AppState::new(
//!     config.clone(),
//!     Arc::new(MemoryExecutionRepository::new(config.lock_timeout())),
//!     Arc::new(FlowRepository::new()),
//!     Arc::new(MemoryQueue::new(config.queue_capacity)),
//!     Arc::new(MemoryQueue::new(config.queue_capacity)),
//!     Arc::new(DefaultConditionEvaluator),
//!     None,
//! );
//! let app = handlers::router(state);
//! ```

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod flow;
pub mod handlers;
pub mod queue;
pub mod result_ext;
pub mod services;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{AppError, AppResult};
pub use result_ext::{MutationResultExt, ResultExt};
