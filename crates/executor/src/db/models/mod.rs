//! Row models of the executor tables.

pub mod execution;
pub mod trigger;

pub use execution::ExecutionRow;
pub use trigger::TriggerRow;
