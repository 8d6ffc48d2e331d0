//! Execution mutation service.
//!
//! Operations come in two layers:
//! - pure transforms (`restart`, `replay`, `mark_as`, `kill`, `resume`,
//!   `pause`, `set_labels`) that take an execution and return the mutated one
//! - `*_by_id` wrappers that apply them through
//!   [`ExecutionRepository::lock_and_update`] and emit the result on the
//!   execution queue once the row is committed
//!
//! Unqueue goes through the flow lock instead, since it changes how many
//! slots the flow holds.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::repository::{ExecutionFilter, ExecutionRepository};
use crate::engine::execution::{
    Execution, ExecutionMetadata, ExecutorState, Label, LABEL_REPLAY, LABEL_RESTARTED,
};
use crate::engine::reset::{reassign_ids, reset_task_runs, ResetInstruction};
use crate::engine::state::StateType;
use crate::error::{AppError, AppResult};
use crate::flow::{Flow, FlowRepository};
use crate::queue::Queue;
use crate::result_ext::MutationResultExt;
use crate::services::concurrency::ConcurrencyController;

/// Output key under which a resume payload is stored on the paused run.
pub const RESUMED_OUTPUT: &str = "resumed";

/// Operation applied to a list of execution ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOperation {
    Restart,
    Replay,
    Kill,
    Resume,
}

impl BulkOperation {
    fn as_str(self) -> &'static str {
        match self {
            BulkOperation::Restart => "restart",
            BulkOperation::Replay => "replay",
            BulkOperation::Kill => "kill",
            BulkOperation::Resume => "resume",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkError {
    pub execution_id: String,
    pub message: String,
}

/// Per-id outcome of a bulk operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    /// Executions the operation applied to
    pub count: usize,
    pub errors: Vec<BulkError>,
}

/// Execution mutation service.
#[derive(Clone)]
pub struct ExecutionService {
    repository: Arc<dyn ExecutionRepository>,
    flows: Arc<FlowRepository>,
    queue: Arc<dyn Queue<Execution>>,
    concurrency: ConcurrencyController,
}

impl ExecutionService {
    pub fn new(
        repository: Arc<dyn ExecutionRepository>,
        flows: Arc<FlowRepository>,
        queue: Arc<dyn Queue<Execution>>,
    ) -> Self {
        Self {
            concurrency: ConcurrencyController::new(repository.clone()),
            repository,
            flows,
            queue,
        }
    }

    pub fn flows(&self) -> &Arc<FlowRepository> {
        &self.flows
    }

    fn flow_revision(&self, execution: &Execution, revision: Option<i32>) -> AppResult<Arc<Flow>> {
        self.flows.find(
            execution.tenant_id.as_deref(),
            &execution.namespace,
            &execution.flow_id,
            Some(revision.unwrap_or(execution.flow_revision)),
        )
    }

    // ---- pure transforms ----

    /// Re-admit a terminal execution in place: failed and killed runs and
    /// their ancestors are reset, successful runs are kept.
    pub fn restart(&self, execution: &Execution, revision: Option<i32>) -> AppResult<Execution> {
        if !execution.is_terminal() {
            return Err(AppError::invalid_state(
                &execution.id,
                execution.current(),
                StateType::Restarted,
            ));
        }

        let flow = self.flow_revision(execution, revision)?;
        let task_runs = reset_task_runs(execution, &flow, ResetInstruction::FromFailure)?;

        let mut restarted = execution.with_state(StateType::Restarted);
        restarted.task_run_list = task_runs;
        restarted.flow_revision = flow.revision;
        restarted.metadata = execution.metadata.next_attempt();

        Ok(restarted.with_system_label(LABEL_RESTARTED, "true"))
    }

    /// Fork a terminal execution from `task_run_id` into a new execution.
    /// Without a task run the replay starts from scratch.
    pub fn replay(
        &self,
        execution: &Execution,
        task_run_id: Option<&str>,
        revision: Option<i32>,
    ) -> AppResult<Execution> {
        if !execution.is_terminal() {
            return Err(AppError::invalid_state(
                &execution.id,
                execution.current(),
                StateType::Restarted,
            ));
        }

        let flow = self.flow_revision(execution, revision)?;
        let task_runs = reset_task_runs(execution, &flow, ResetInstruction::FromPoint { task_run_id })?;

        let mut replay = execution.with_state(StateType::Restarted);
        replay.id = Uuid::new_v4().to_string();
        replay.parent_id = Some(execution.id.clone());
        replay.task_run_list = reassign_ids(task_runs);
        replay.flow_revision = flow.revision;
        replay.outputs = Map::new();
        replay.metadata = ExecutionMetadata::default();
        replay.deleted = false;

        Ok(replay.with_system_label(LABEL_REPLAY, "true"))
    }

    /// Force one task run into a terminal state and re-admit the execution.
    pub fn mark_as(
        &self,
        execution: &Execution,
        flow: &Flow,
        task_run_id: &str,
        state: StateType,
    ) -> AppResult<Execution> {
        if matches!(
            execution.current(),
            StateType::Restarted | StateType::Killing
        ) {
            return Err(AppError::invalid_task_run_state(
                &execution.id,
                task_run_id,
                execution.current(),
                state,
            ));
        }

        let task_runs = reset_task_runs(
            execution,
            flow,
            ResetInstruction::ForceState { task_run_id, state },
        )?;

        let mut marked = execution.with_state(StateType::Restarted);
        marked.task_run_list = task_runs;
        marked.metadata = execution.metadata.next_attempt();
        Ok(marked)
    }

    /// Kill every non-terminal task run. The execution goes through KILLING
    /// and ends in `state` when given, otherwise RESTARTED so the executor
    /// finalizes it.
    pub fn kill(&self, execution: &Execution, state: Option<StateType>) -> AppResult<Execution> {
        if execution.is_terminal() {
            return Err(AppError::invalid_state(
                &execution.id,
                execution.current(),
                StateType::Killing,
            ));
        }
        if let Some(state) = state {
            if !state.is_terminal() {
                return Err(AppError::Validation(format!(
                    "A killed execution must end in a final state, got {}",
                    state
                )));
            }
        }

        // paused runs are killed like any other open run
        let mut killed = execution.with_state(StateType::Killing);
        killed.task_run_list = execution
            .task_run_list
            .iter()
            .map(|run| {
                if run.current().is_terminal() {
                    run.clone()
                } else {
                    run.killed()
                }
            })
            .collect();

        Ok(killed.with_state(state.unwrap_or(StateType::Restarted)))
    }

    /// Resume a paused execution: paused runs go to `state` (RUNNING or
    /// KILLING) and keep `payload` as their output.
    pub fn resume(
        &self,
        execution: &Execution,
        flow: &Flow,
        state: StateType,
        payload: Option<Map<String, Value>>,
    ) -> AppResult<Execution> {
        if !execution.current().is_paused() {
            return Err(AppError::invalid_state(
                &execution.id,
                execution.current(),
                state,
            ));
        }
        if !matches!(state, StateType::Running | StateType::Killing) {
            return Err(AppError::Validation(format!(
                "Paused task runs resume to RUNNING or KILLING, got {}",
                state
            )));
        }

        let mut resumed = execution.with_state(StateType::Restarted);
        for run in resumed.task_run_list.iter_mut() {
            if !run.current().is_paused() {
                continue;
            }
            if flow.find_task(&run.task_id).is_none() {
                return Err(AppError::NotFound(format!(
                    "Task '{}' in flow '{}.{}'",
                    run.task_id, flow.namespace, flow.id
                )));
            }
            *run = run.with_state(state);
            if let Some(payload) = &payload {
                run.outputs
                    .insert(RESUMED_OUTPUT.to_string(), Value::Object(payload.clone()));
            }
        }

        Ok(resumed)
    }

    /// Hold a running execution: open task runs finish, nothing new is
    /// dispatched until it is resumed.
    pub fn pause(&self, execution: &Execution) -> AppResult<Execution> {
        if execution.current() != StateType::Running {
            return Err(AppError::invalid_state(
                &execution.id,
                execution.current(),
                StateType::Paused,
            ));
        }
        Ok(execution.with_state(StateType::Paused))
    }

    /// Replace the user labels of a terminated execution. System labels are
    /// kept as they are.
    pub fn set_labels(&self, execution: &Execution, labels: Vec<Label>) -> AppResult<Execution> {
        if !execution.is_terminal() {
            return Err(AppError::invalid_state(
                &execution.id,
                execution.current(),
                "SET_LABELS",
            ));
        }

        let mut labelled = execution.clone();
        labelled.labels.retain(Label::is_system);
        labelled.with_user_labels(labels)
    }

    // ---- locked operations ----

    /// Apply `transform` under the row lock, retrying once on a concurrent
    /// modification, then emit the committed execution.
    async fn mutate<F>(&self, id: &str, operation: &str, transform: F) -> AppResult<Execution>
    where
        F: Fn(&Execution) -> AppResult<Execution> + Send + Sync,
    {
        let mut retried = false;
        loop {
            let result = self
                .repository
                .lock_and_update(
                    id,
                    Box::new(|execution: Execution, executor_state: ExecutorState| {
                        if execution.deleted {
                            return Err(AppError::NotFound(format!("Execution '{}'", execution.id)));
                        }
                        let mutated = transform(&execution)?;
                        let executor_state = if mutated.is_terminal() {
                            executor_state
                        } else {
                            executor_state.reopened()
                        };
                        Ok((mutated, executor_state))
                    }),
                )
                .await;

            match result {
                Err(AppError::ConcurrentModification { .. }) if !retried => {
                    warn!(execution_id = %id, operation, "Concurrent modification, retrying once");
                    retried = true;
                }
                result => {
                    let execution = result.log_mutation(id, operation)?;
                    info!(
                        execution_id = %id,
                        operation,
                        state = %execution.current(),
                        "Execution mutated"
                    );
                    self.queue.emit(execution.clone()).await?;
                    return Ok(execution);
                }
            }
        }
    }

    /// Execution by id; soft-deleted executions are not found.
    pub async fn get(&self, id: &str) -> AppResult<Execution> {
        match self.repository.find_by_id(id).await? {
            Some(execution) if !execution.deleted => Ok(execution),
            _ => Err(AppError::NotFound(format!("Execution '{}'", id))),
        }
    }

    pub async fn list(&self, filter: &ExecutionFilter) -> AppResult<Vec<Execution>> {
        self.repository.find(filter).await
    }

    pub async fn restart_by_id(&self, id: &str, revision: Option<i32>) -> AppResult<Execution> {
        self.mutate(id, "restart", |execution| self.restart(execution, revision))
            .await
    }

    /// Create the replayed execution. The source row is only read.
    pub async fn replay_by_id(
        &self,
        id: &str,
        task_run_id: Option<&str>,
        revision: Option<i32>,
    ) -> AppResult<Execution> {
        let source = self.get(id).await?;
        let replay = self.replay(&source, task_run_id, revision)?;

        self.repository.save(&replay).await?;
        info!(
            execution_id = %replay.id,
            parent_id = %source.id,
            task_runs = replay.task_run_list.len(),
            "Execution replayed"
        );
        self.queue.emit(replay.clone()).await?;
        Ok(replay)
    }

    pub async fn mark_as_by_id(
        &self,
        id: &str,
        task_run_id: &str,
        state: StateType,
    ) -> AppResult<Execution> {
        self.mutate(id, "mark_as", |execution| {
            let flow = self.flows.find_for_execution(execution)?;
            self.mark_as(execution, &flow, task_run_id, state)
        })
        .await
    }

    pub async fn kill_by_id(&self, id: &str, state: Option<StateType>) -> AppResult<Execution> {
        self.mutate(id, "kill", |execution| self.kill(execution, state))
            .await
    }

    pub async fn resume_by_id(
        &self,
        id: &str,
        state: StateType,
        payload: Option<Map<String, Value>>,
    ) -> AppResult<Execution> {
        self.mutate(id, "resume", |execution| {
            let flow = self.flows.find_for_execution(execution)?;
            self.resume(execution, &flow, state, payload.clone())
        })
        .await
    }

    pub async fn pause_by_id(&self, id: &str) -> AppResult<Execution> {
        self.mutate(id, "pause", |execution| self.pause(execution))
            .await
    }

    pub async fn set_labels_by_id(&self, id: &str, labels: Vec<Label>) -> AppResult<Execution> {
        self.mutate(id, "set_labels", |execution| {
            self.set_labels(execution, labels.clone())
        })
        .await
    }

    /// Take a queued execution out of its flow's queue, see
    /// [`ConcurrencyController::unqueue`].
    pub async fn unqueue_by_id(&self, id: &str, state: Option<StateType>) -> AppResult<Execution> {
        let execution = self.get(id).await?;
        if !execution.current().is_queued() {
            return Err(AppError::invalid_state(
                &execution.id,
                execution.current(),
                state.unwrap_or(StateType::Running),
            ));
        }

        let flow = self.flows.find_for_execution(&execution)?;
        let unqueued = self
            .concurrency
            .unqueue(id, &flow, state)
            .await
            .log_mutation(id, "unqueue")?;
        self.queue.emit(unqueued.clone()).await?;
        Ok(unqueued)
    }

    /// Apply `operation` to every id with default arguments. Failures are
    /// collected per id and do not stop the others.
    pub async fn bulk(&self, ids: &[String], operation: BulkOperation) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for id in ids {
            let result = match operation {
                BulkOperation::Restart => self.restart_by_id(id, None).await,
                BulkOperation::Replay => self.replay_by_id(id, None, None).await,
                BulkOperation::Kill => self.kill_by_id(id, None).await,
                BulkOperation::Resume => self.resume_by_id(id, StateType::Running, None).await,
            };
            match result {
                Ok(_) => outcome.count += 1,
                Err(e) => outcome.errors.push(BulkError {
                    execution_id: id.clone(),
                    message: e.to_string(),
                }),
            }
        }

        info!(
            operation = operation.as_str(),
            requested = ids.len(),
            applied = outcome.count,
            "Bulk operation finished"
        );
        outcome
    }

    /// Soft delete a terminal execution.
    pub async fn delete(&self, id: &str) -> AppResult<Execution> {
        self.mutate(id, "delete", |execution| {
            if !execution.is_terminal() {
                return Err(AppError::invalid_state(
                    &execution.id,
                    execution.current(),
                    "DELETE",
                ));
            }
            let mut deleted = execution.clone();
            deleted.deleted = true;
            Ok(deleted)
        })
        .await
    }

    /// Hard delete the terminal executions matching `filter`, soft-deleted
    /// ones included. Returns how many rows were removed.
    pub async fn purge(&self, filter: &ExecutionFilter) -> AppResult<usize> {
        let terminal = StateType::terminal_types();
        let states = match &filter.states {
            Some(states) => states
                .iter()
                .copied()
                .filter(|state| terminal.contains(state))
                .collect(),
            None => terminal,
        };
        let filter = ExecutionFilter {
            states: Some(states),
            include_deleted: true,
            ..filter.clone()
        };

        let mut purged = 0;
        for execution in self.repository.find(&filter).await? {
            if self.repository.remove(&execution.id).await? {
                purged += 1;
            }
        }

        info!(purged, "Executions purged");
        Ok(purged)
    }
}
