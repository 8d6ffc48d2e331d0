//! Execution orchestration.
//!
//! Two entry points, both pure:
//! - [`Orchestrator::apply_update`] folds a worker report into the execution
//! - [`Orchestrator::evaluate`] walks the flow graph against the task runs,
//!   creates the next runs, dispatches leaves and settles containers and the
//!   execution itself
//!
//! The caller runs both under the execution lock and persists the result.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::flow::{Flow, Task, TaskKind};

use super::evaluator::{ConditionEvaluator, DefaultConditionEvaluator};
use super::execution::{Execution, ExecutorState};
use super::state::StateType;
use super::task_run::TaskRun;

/// Report sent by a worker about one task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunUpdate {
    pub task_run_id: String,

    /// Attempt index the report is about; `None` means the open attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<usize>,

    pub state: StateType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Map<String, Value>>,
}

/// Unit of work handed to workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub namespace: String,
    pub flow_id: String,
    pub task_run_id: String,
    pub task_id: String,
    pub attempt: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value: Vec<String>,
    #[serde(default)]
    pub params: Value,
}

/// Outcome of an evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub execution: Execution,
    pub executor_state: ExecutorState,
    pub jobs: Vec<WorkerJob>,
}

/// Progress of a branch of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Waiting,
    Done(StateType),
}

/// Workflow orchestrator.
#[derive(Clone)]
pub struct Orchestrator {
    evaluator: Arc<dyn ConditionEvaluator>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(Arc::new(DefaultConditionEvaluator))
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        Self { evaluator }
    }

    /// Fold a worker report into the execution.
    ///
    /// Reports about a settled run or an attempt other than the open one are
    /// stale and leave the execution untouched.
    pub fn apply_update(
        &self,
        flow: &Flow,
        execution: &Execution,
        update: &TaskRunUpdate,
    ) -> AppResult<Execution> {
        let run = execution.find_task_run(&update.task_run_id)?;

        if execution.is_terminal() || run.current().is_terminal() {
            debug!(
                execution_id = %execution.id,
                task_run_id = %run.id,
                state = %update.state,
                "Ignoring report for a settled task run"
            );
            return Ok(execution.clone());
        }

        let open = run.open_attempt_index();
        if let Some(attempt) = update.attempt {
            if attempt != open {
                debug!(
                    execution_id = %execution.id,
                    task_run_id = %run.id,
                    attempt,
                    open,
                    "Ignoring report for a stale attempt"
                );
                return Ok(execution.clone());
            }
        }

        let task = flow.find_task(&run.task_id).ok_or_else(|| {
            AppError::NotFound(format!(
                "Task '{}' in flow '{}.{}'",
                run.task_id, flow.namespace, flow.id
            ))
        })?;
        if task.is_flowable() || task.is_pause() {
            return Err(AppError::Validation(format!(
                "Task run '{}' ({}) is not executed by workers",
                run.id, run.task_id
            )));
        }

        let mut updated = match update.state {
            StateType::Running => run
                .with_open_attempt(StateType::Running)
                .with_state(StateType::Running),
            StateType::Failed if (open as u32) + 1 < task.max_attempts() => {
                info!(
                    execution_id = %execution.id,
                    task_run_id = %run.id,
                    attempt = open,
                    max_attempts = task.max_attempts(),
                    "Task run failed, retrying"
                );
                run.with_open_attempt(StateType::Retried)
                    .with_state(StateType::Retrying)
            }
            StateType::Failed if task.allow_failure => run
                .with_open_attempt(StateType::Failed)
                .with_state(StateType::Warning),
            StateType::Success | StateType::Warning | StateType::Failed | StateType::Killed => {
                run.with_open_attempt(update.state).with_state(update.state)
            }
            other => {
                return Err(AppError::BadRequest(format!(
                    "Workers cannot report state {}",
                    other
                )))
            }
        };

        if let Some(outputs) = &update.outputs {
            updated
                .outputs
                .extend(outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        execution.with_task_run(updated)
    }

    /// Advance the execution as far as the current task runs allow.
    pub fn evaluate(
        &self,
        flow: &Flow,
        execution: &Execution,
        executor_state: &ExecutorState,
    ) -> AppResult<Evaluation> {
        let unchanged = Evaluation {
            execution: execution.clone(),
            executor_state: executor_state.clone(),
            jobs: Vec::new(),
        };

        // paused by a pause task or by hand: reports are folded in, nothing
        // moves until resume
        let current = execution.current();
        if current.is_terminal() || current.is_queued() || current.is_paused() {
            return Ok(unchanged);
        }

        if current == StateType::Killing || execution.state.is_restarted_after_kill() {
            let mut killed = execution.clone();
            killed.task_run_list = killed
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
            info!(execution_id = %execution.id, "Execution killed");
            return Ok(Evaluation {
                execution: killed.with_state(StateType::Killed),
                executor_state: executor_state.clone(),
                jobs: Vec::new(),
            });
        }

        let mut resolver = Resolver {
            flow,
            execution,
            evaluator: self.evaluator.as_ref(),
            runs: settle_runs(flow, &execution.task_run_list),
            executor_state: executor_state.clone(),
            jobs: Vec::new(),
            paused: false,
        };

        let outcome = match resolver.resolve_sequence(&flow.tasks, None, &[])? {
            Progress::Done(StateType::Failed) if !flow.errors.is_empty() => {
                match resolver.resolve_sequence(&flow.errors, None, &[])? {
                    Progress::Waiting => Progress::Waiting,
                    Progress::Done(_) => Progress::Done(StateType::Failed),
                }
            }
            other => other,
        };

        let Resolver {
            runs,
            executor_state,
            jobs,
            paused,
            ..
        } = resolver;

        let mut next = execution.clone();
        next.task_run_list = runs;
        if matches!(current, StateType::Created | StateType::Restarted) {
            next = next.with_state(StateType::Running);
        }

        match outcome {
            Progress::Done(state) => {
                info!(execution_id = %next.id, state = %state, "Execution finished");
                next = next.with_state(state);
            }
            Progress::Waiting if paused => {
                info!(execution_id = %next.id, "Execution paused");
                next = next.with_state(StateType::Paused);
            }
            Progress::Waiting => {}
        }

        if !jobs.is_empty() {
            debug!(execution_id = %next.id, jobs = jobs.len(), "Dispatching task runs");
        }

        Ok(Evaluation {
            execution: next,
            executor_state,
            jobs,
        })
    }
}

/// Settle runs whose outcome is already decided: kills in progress and
/// resumed pauses.
fn settle_runs(flow: &Flow, runs: &[TaskRun]) -> Vec<TaskRun> {
    runs.iter()
        .map(|run| match run.current() {
            StateType::Killing => run.killed(),
            StateType::Running
                if flow
                    .find_task(&run.task_id)
                    .map(Task::is_pause)
                    .unwrap_or(false) =>
            {
                run.with_state(StateType::Success)
            }
            _ => run.clone(),
        })
        .collect()
}

/// How a settled run counts for its parent.
fn effective_state(task: &Task, state: StateType) -> StateType {
    match state {
        StateType::Failed if task.allow_failure => StateType::Warning,
        StateType::Skipped => StateType::Success,
        other => other,
    }
}

/// Whether a settled child stops its sequence.
fn blocks(state: StateType) -> bool {
    matches!(
        state,
        StateType::Failed | StateType::Killed | StateType::Cancelled
    )
}

/// Worst outcome wins: KILLED, then FAILED, then WARNING, then SUCCESS.
fn worst(states: &[StateType]) -> StateType {
    fn rank(state: StateType) -> u8 {
        match state {
            StateType::Killed => 3,
            StateType::Failed | StateType::Cancelled => 2,
            StateType::Warning => 1,
            _ => 0,
        }
    }

    match states.iter().copied().max_by_key(|s| rank(*s)).map(rank) {
        Some(3) => StateType::Killed,
        Some(2) => StateType::Failed,
        Some(1) => StateType::Warning,
        _ => StateType::Success,
    }
}

struct Resolver<'a> {
    flow: &'a Flow,
    execution: &'a Execution,
    evaluator: &'a dyn ConditionEvaluator,
    runs: Vec<TaskRun>,
    executor_state: ExecutorState,
    jobs: Vec<WorkerJob>,
    paused: bool,
}

impl Resolver<'_> {
    fn resolve_sequence(
        &mut self,
        tasks: &[Task],
        parent: Option<&str>,
        value: &[String],
    ) -> AppResult<Progress> {
        let mut states = Vec::with_capacity(tasks.len());
        for task in tasks {
            match self.resolve_task(task, parent, value)? {
                Progress::Waiting => return Ok(Progress::Waiting),
                Progress::Done(state) if blocks(state) => return Ok(Progress::Done(state)),
                Progress::Done(state) => states.push(state),
            }
        }
        Ok(Progress::Done(worst(&states)))
    }

    fn resolve_parallel(
        &mut self,
        tasks: &[Task],
        parent: &str,
        value: &[String],
    ) -> AppResult<Progress> {
        let mut states = Vec::with_capacity(tasks.len());
        let mut waiting = false;
        for task in tasks {
            match self.resolve_task(task, Some(parent), value)? {
                Progress::Waiting => waiting = true,
                Progress::Done(state) => states.push(state),
            }
        }
        if waiting {
            Ok(Progress::Waiting)
        } else {
            Ok(Progress::Done(worst(&states)))
        }
    }

    fn resolve_each(
        &mut self,
        values: &[String],
        tasks: &[Task],
        parent: &str,
        value: &[String],
    ) -> AppResult<Progress> {
        let mut states = Vec::with_capacity(values.len());
        for item in values {
            let mut iteration = value.to_vec();
            iteration.push(item.clone());
            match self.resolve_sequence(tasks, Some(parent), &iteration)? {
                Progress::Waiting => return Ok(Progress::Waiting),
                Progress::Done(state) if blocks(state) => return Ok(Progress::Done(state)),
                Progress::Done(state) => states.push(state),
            }
        }
        Ok(Progress::Done(worst(&states)))
    }

    fn position(&self, task_id: &str, parent: Option<&str>, value: &[String]) -> Option<usize> {
        self.runs
            .iter()
            .position(|run| run.is_at(task_id, parent, value))
    }

    fn resolve_task(
        &mut self,
        task: &Task,
        parent: Option<&str>,
        value: &[String],
    ) -> AppResult<Progress> {
        let index = match self.position(&task.id, parent, value) {
            Some(index) => index,
            None => {
                let mut run = TaskRun::new(&task.id, parent, value.to_vec());
                if let Some(condition) = &task.run_if {
                    if !self.evaluator.test(self.execution, condition) {
                        debug!(task_id = %task.id, "Precondition not met, skipping");
                        run = run.with_state(StateType::Skipped);
                    }
                }
                self.runs.push(run);
                self.runs.len() - 1
            }
        };

        let current = self.runs[index].current();
        if current.is_terminal() {
            return Ok(Progress::Done(effective_state(task, current)));
        }

        match &task.kind {
            TaskKind::Sequential { tasks }
            | TaskKind::Parallel { tasks }
            | TaskKind::Each { tasks, .. } => {
                if matches!(current, StateType::Created | StateType::Restarted) {
                    self.runs[index] = self.runs[index].with_state(StateType::Running);
                }
                let run_id = self.runs[index].id.clone();
                let run_value = self.runs[index].value.clone();

                let progress = match &task.kind {
                    TaskKind::Parallel { .. } => {
                        self.resolve_parallel(tasks, &run_id, &run_value)?
                    }
                    TaskKind::Each { values, .. } => {
                        self.resolve_each(values, tasks, &run_id, &run_value)?
                    }
                    _ => self.resolve_sequence(tasks, Some(&run_id), &run_value)?,
                };

                match progress {
                    Progress::Done(state) => {
                        let slot = self
                            .runs
                            .iter_mut()
                            .find(|run| run.id == run_id)
                            .ok_or_else(|| AppError::Internal(format!("Task run '{}' lost", run_id)))?;
                        *slot = slot.with_state(state);
                        Ok(Progress::Done(effective_state(task, state)))
                    }
                    Progress::Waiting => Ok(Progress::Waiting),
                }
            }
            TaskKind::Pause {} => {
                if matches!(current, StateType::Created | StateType::Restarted) {
                    self.runs[index] = self.runs[index].with_state(StateType::Paused);
                }
                if self.runs[index].current().is_paused() {
                    self.paused = true;
                }
                Ok(Progress::Waiting)
            }
            TaskKind::Task { params } => {
                if matches!(
                    current,
                    StateType::Created
                        | StateType::Restarted
                        | StateType::Retrying
                        | StateType::Running
                ) {
                    self.dispatch(index, params);
                }
                Ok(Progress::Waiting)
            }
        }
    }

    fn dispatch(&mut self, index: usize, params: &Value) {
        let run = &self.runs[index];
        let attempt = run.open_attempt_index();
        if self.executor_state.is_dispatched(&run.id, attempt) {
            return;
        }

        let dispatched = run
            .with_open_attempt(StateType::Running)
            .with_state(StateType::Running);
        self.executor_state.mark_dispatched(&dispatched.id, attempt);
        self.jobs.push(WorkerJob {
            execution_id: self.execution.id.clone(),
            tenant_id: self.execution.tenant_id.clone(),
            namespace: self.flow.namespace.clone(),
            flow_id: self.flow.id.clone(),
            task_run_id: dispatched.id.clone(),
            task_id: dispatched.task_id.clone(),
            attempt,
            value: dispatched.value.clone(),
            params: params.clone(),
        });
        self.runs[index] = dispatched;
    }
}
