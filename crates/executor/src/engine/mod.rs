//! Execution engine.
//!
//! - **State**: state types, transition history
//! - **Task runs**: runs, attempts and the task-run tree
//! - **Execution**: the execution aggregate and executor bookkeeping
//! - **Reset**: task-run resets behind restart, replay and markAs
//! - **Orchestrator**: worker reports and next-task resolution
//! - **Evaluator**: conditions for triggers and preconditions

pub mod evaluator;
pub mod execution;
pub mod orchestrator;
pub mod reset;
pub mod state;
pub mod task_run;

pub use evaluator::{ConditionEvaluator, DefaultConditionEvaluator};
pub use execution::{Execution, ExecutionMetadata, ExecutionTrigger, ExecutorState, Label};
pub use orchestrator::{Evaluation, Orchestrator, TaskRunUpdate, WorkerJob};
pub use reset::{reassign_ids, reset_task_runs, ResetInstruction};
pub use state::{History, State, StateType};
pub use task_run::{TaskRun, TaskRunAttempt, TaskRunTree};
