//! Executor: drives executions from submission to their final state.
//!
//! Every step runs under the execution row lock:
//! 1. fold a worker report in (optional)
//! 2. evaluate the flow graph, creating and dispatching task runs
//!
//! After commit the new state is emitted on the execution queue and
//! dispatched jobs are published for workers. A terminal execution whose
//! side effects have not run yet frees its concurrency slot, then is marked
//! handled under its lock, then fires flow triggers. A failed release leaves
//! the mark unset, so the next processing retries it.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::db::repository::{ExecutionFilter, ExecutionRepository};
use crate::engine::evaluator::ConditionEvaluator;
use crate::engine::execution::{Execution, ExecutionTrigger, ExecutorState, Label};
use crate::engine::orchestrator::{Orchestrator, TaskRunUpdate, WorkerJob};
use crate::engine::state::StateType;
use crate::error::{AppError, AppResult};
use crate::flow::{Flow, FlowRepository, TriggerKind};
use crate::queue::Queue;
use crate::result_ext::{MutationResultExt, ResultExt};
use crate::services::concurrency::ConcurrencyController;

/// Trigger type recorded on executions started by a flow trigger.
pub const FLOW_TRIGGER_TYPE: &str = "flow";

/// Trigger type recorded on executions started by a schedule.
pub const SCHEDULE_TRIGGER_TYPE: &str = "schedule";

/// Execution request.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    /// Preassigned execution id, for callers that record it beforehand.
    pub execution_id: Option<String>,
    pub tenant_id: Option<String>,
    pub namespace: String,
    pub flow_id: String,
    pub inputs: Map<String, Value>,
    pub labels: Vec<Label>,
    pub trigger: Option<ExecutionTrigger>,
}

/// Result of one locked step.
struct Step {
    execution: Execution,
    changed: bool,
    jobs: Vec<WorkerJob>,
    terminated: bool,
}

/// Resolve declared inputs against the provided values.
///
/// Missing values take the declared default; a required input with neither
/// is rejected. Undeclared inputs are kept as given.
pub fn resolve_inputs(flow: &Flow, provided: &Map<String, Value>) -> AppResult<Map<String, Value>> {
    let mut inputs = provided.clone();
    for input in &flow.inputs {
        if inputs.contains_key(&input.id) {
            continue;
        }
        match &input.default {
            Some(default) => {
                inputs.insert(input.id.clone(), default.clone());
            }
            None if input.required => {
                return Err(AppError::Validation(format!(
                    "Missing required input '{}' for flow '{}.{}'",
                    input.id, flow.namespace, flow.id
                )));
            }
            None => {}
        }
    }
    Ok(inputs)
}

#[derive(Clone)]
pub struct Executor {
    repository: Arc<dyn ExecutionRepository>,
    flows: Arc<FlowRepository>,
    executions: Arc<dyn Queue<Execution>>,
    jobs: Arc<dyn Queue<WorkerJob>>,
    orchestrator: Orchestrator,
    evaluator: Arc<dyn ConditionEvaluator>,
    concurrency: ConcurrencyController,
}

impl Executor {
    pub fn new(
        repository: Arc<dyn ExecutionRepository>,
        flows: Arc<FlowRepository>,
        executions: Arc<dyn Queue<Execution>>,
        jobs: Arc<dyn Queue<WorkerJob>>,
        evaluator: Arc<dyn ConditionEvaluator>,
    ) -> Self {
        Self {
            concurrency: ConcurrencyController::new(repository.clone()),
            orchestrator: Orchestrator::new(evaluator.clone()),
            repository,
            flows,
            executions,
            jobs,
            evaluator,
        }
    }

    /// Create an execution and run its first evaluation.
    pub async fn submit(&self, submission: Submission) -> AppResult<Execution> {
        let created = self.create(submission).await?;
        self.process(&created.id).await
    }

    /// Validate, admit and persist a new execution without evaluating it.
    async fn create(&self, submission: Submission) -> AppResult<Execution> {
        let flow = self.flows.find(
            submission.tenant_id.as_deref(),
            &submission.namespace,
            &submission.flow_id,
            None,
        )?;
        if flow.disabled {
            return Err(AppError::Validation(format!(
                "Flow '{}.{}' is disabled",
                flow.namespace, flow.id
            )));
        }

        let flow_labels: Vec<Label> = flow
            .labels
            .iter()
            .map(|(key, value)| Label::new(key, value))
            .collect();

        let mut execution = Execution::for_flow(&flow)
            .with_user_labels(flow_labels)?
            .with_user_labels(submission.labels)?;
        execution.inputs = resolve_inputs(&flow, &submission.inputs)?;
        execution.trigger = submission.trigger;
        if let Some(id) = submission.execution_id {
            execution.id = id;
        }

        let admitted = self.concurrency.admit(execution, &flow).await?;
        info!(
            execution_id = %admitted.id,
            namespace = %admitted.namespace,
            flow_id = %admitted.flow_id,
            revision = admitted.flow_revision,
            state = %admitted.current(),
            "Execution created"
        );

        self.executions.emit(admitted.clone()).await?;
        Ok(admitted)
    }

    /// Fold a worker report in and advance the execution.
    pub async fn report(&self, execution_id: &str, update: TaskRunUpdate) -> AppResult<Execution> {
        self.advance(execution_id, Some(update), "report").await
    }

    /// Advance the execution as far as its task runs allow.
    pub async fn process(&self, execution_id: &str) -> AppResult<Execution> {
        self.advance(execution_id, None, "process").await
    }

    async fn advance(
        &self,
        execution_id: &str,
        update: Option<TaskRunUpdate>,
        operation: &str,
    ) -> AppResult<Execution> {
        let step = self
            .locked_step(execution_id, update)
            .await
            .log_mutation(execution_id, operation)?;

        if step.changed {
            self.executions.emit(step.execution.clone()).await?;
        }
        for job in step.jobs {
            debug!(
                execution_id = %job.execution_id,
                task_run_id = %job.task_run_id,
                task_id = %job.task_id,
                attempt = job.attempt,
                "Dispatching job"
            );
            self.jobs.emit(job).await?;
        }
        if step.terminated {
            self.on_terminal(&step.execution).await?;
        }

        Ok(step.execution)
    }

    async fn locked_step(&self, execution_id: &str, update: Option<TaskRunUpdate>) -> AppResult<Step> {
        let mut changed = false;
        let mut jobs = Vec::new();
        let mut terminated = false;

        let execution = self
            .repository
            .lock_and_update(
                execution_id,
                Box::new(|execution: Execution, executor_state: ExecutorState| {
                    if execution.deleted {
                        return Ok((execution, executor_state));
                    }
                    let flow = self.flows.find_for_execution(&execution)?;

                    let updated = match &update {
                        Some(update) => self.orchestrator.apply_update(&flow, &execution, update)?,
                        None => execution.clone(),
                    };
                    let evaluation = self.orchestrator.evaluate(&flow, &updated, &executor_state)?;

                    terminated = evaluation.execution.is_terminal()
                        && !evaluation.executor_state.terminal_handled;
                    changed = evaluation.execution != execution;
                    jobs = evaluation.jobs;

                    Ok((evaluation.execution, evaluation.executor_state))
                }),
            )
            .await?;

        Ok(Step {
            execution,
            changed,
            jobs,
            terminated,
        })
    }

    /// Flag the terminal side effects as done. Returns false when another
    /// caller got there first or the execution left its terminal state.
    async fn mark_terminal_handled(&self, execution_id: &str) -> AppResult<bool> {
        let mut marked = false;
        self.repository
            .lock_and_update(
                execution_id,
                Box::new(|execution: Execution, mut executor_state: ExecutorState| {
                    if execution.is_terminal() && !executor_state.terminal_handled {
                        executor_state.terminal_handled = true;
                        marked = true;
                    }
                    Ok((execution, executor_state))
                }),
            )
            .await?;
        Ok(marked)
    }

    /// Side effects of a terminated execution: free its concurrency slot and
    /// fire the flow triggers it satisfies.
    ///
    /// The release recounts under the flow lock, so running it again after a
    /// failure is safe. Triggers fire only for the caller that sets the mark.
    async fn on_terminal(&self, execution: &Execution) -> AppResult<()> {
        let flow = self.flows.find_for_execution(execution)?;
        for started in self.concurrency.release(&flow).await? {
            self.executions.emit(started).await?;
        }

        if !self.mark_terminal_handled(&execution.id).await? {
            return Ok(());
        }
        info!(
            execution_id = %execution.id,
            state = %execution.current(),
            "Execution terminated"
        );

        for flow in self.flows.find_all()? {
            if flow.disabled || flow.key() == execution.flow_key() {
                continue;
            }
            for trigger in flow.active_triggers() {
                let TriggerKind::Flow { conditions } = &trigger.kind else {
                    continue;
                };
                if !self.evaluator.test_all(execution, conditions) {
                    continue;
                }

                let submission = Submission {
                    tenant_id: flow.tenant_id.clone(),
                    namespace: flow.namespace.clone(),
                    flow_id: flow.id.clone(),
                    trigger: Some(ExecutionTrigger {
                        id: trigger.id.clone(),
                        trigger_type: FLOW_TRIGGER_TYPE.to_string(),
                        variables: trigger_variables(execution),
                    }),
                    ..Default::default()
                };
                match self.create(submission).await {
                    Ok(created) => info!(
                        execution_id = %created.id,
                        upstream_execution_id = %execution.id,
                        trigger_id = %trigger.id,
                        "Flow trigger fired"
                    ),
                    Err(e) => warn!(
                        error = %e,
                        namespace = %flow.namespace,
                        flow_id = %flow.id,
                        trigger_id = %trigger.id,
                        "Flow trigger failed to start an execution"
                    ),
                }
            }
        }
        Ok(())
    }

    /// React to an execution notification.
    pub async fn handle(&self, execution: &Execution) -> AppResult<()> {
        if execution.deleted {
            return Ok(());
        }
        match self.process(&execution.id).await {
            Ok(_) => Ok(()),
            // purged between emit and handling
            Err(AppError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Process every stored execution that may still have work to do.
    /// Queued ones wait for a slot and are left alone. Returns how many were
    /// processed.
    pub async fn recover(&self) -> AppResult<usize> {
        let filter = ExecutionFilter {
            states: Some(
                StateType::ALL
                    .into_iter()
                    .filter(|state| !state.is_terminal() && !state.is_queued())
                    .collect(),
            ),
            ..Default::default()
        };

        let mut processed = 0;
        for execution in self.repository.find(&filter).await? {
            if self.handle(&execution).await.log_for(&execution.id, "recover").is_ok() {
                processed += 1;
            }
        }
        info!(processed, "Open executions rescanned");
        Ok(processed)
    }

    /// Consume the execution queue forever. Open executions are rescanned at
    /// start and whenever the queue reports dropped notifications.
    pub async fn run(&self) -> AppResult<()> {
        let mut notifications = self.executions.subscribe(Box::new(|_| true)).await?;
        info!("Executor started");
        self.recover().await?;

        loop {
            tokio::select! {
                notification = notifications.next() => {
                    let Some(execution) = notification else {
                        break;
                    };
                    let _ = self.handle(&execution).await.log_for(&execution.id, "handle");
                }
                _ = self.executions.lagged() => {
                    warn!("Execution notifications dropped, rescanning");
                    let _ = self.recover().await.log("rescan");
                }
            }
        }

        warn!("Execution queue closed, executor stopping");
        Ok(())
    }
}

fn trigger_variables(execution: &Execution) -> Map<String, Value> {
    let variables = json!({
        "executionId": execution.id,
        "namespace": execution.namespace,
        "flowId": execution.flow_id,
        "state": execution.current(),
    });
    match variables {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
