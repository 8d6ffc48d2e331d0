//! Service layer.
//!
//! Services own the mutation paths over stored executions and coordinate
//! storage, flows and queues for the handlers and background loops.

pub mod concurrency;
pub mod execution;
pub mod executor;
pub mod scheduler;

pub use concurrency::ConcurrencyController;
pub use execution::{BulkError, BulkOperation, BulkOutcome, ExecutionService};
pub use executor::{Executor, Submission};
pub use scheduler::Scheduler;
