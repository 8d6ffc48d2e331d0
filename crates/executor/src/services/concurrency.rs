//! Per-flow concurrency admission.
//!
//! Admission and dequeue both run inside [`ExecutionRepository::lock_flow`],
//! so the count of held slots is read and acted on under the same lock.
//! Every non-terminal execution holds a slot, paused and queued ones
//! included.

use std::sync::Arc;

use tracing::{debug, info};

use crate::db::repository::ExecutionRepository;
use crate::engine::execution::Execution;
use crate::engine::state::StateType;
use crate::error::{AppError, AppResult};
use crate::flow::{ConcurrencyBehavior, Flow};

/// Outcome of admitting a new execution against the flow's active ones.
pub fn admission_state(flow: &Flow, active: &[Execution]) -> Option<StateType> {
    let concurrency = flow.concurrency()?;
    if active.len() < concurrency.limit as usize {
        return Some(StateType::Running);
    }
    Some(match concurrency.behavior {
        ConcurrencyBehavior::Cancel => StateType::Cancelled,
        ConcurrencyBehavior::Fail => StateType::Failed,
        ConcurrencyBehavior::Queue => StateType::Queued,
    })
}

/// Queued executions to start, oldest first, given the flow's active ones.
pub fn dequeue(flow: &Flow, active: &[Execution]) -> Vec<Execution> {
    let Some(concurrency) = flow.concurrency() else {
        // limit removed: drain everything left in the queue
        return active
            .iter()
            .filter(|e| e.current().is_queued())
            .map(|e| e.with_state(StateType::Running))
            .collect();
    };

    let held = active.iter().filter(|e| !e.current().is_queued()).count();
    let free = (concurrency.limit as usize).saturating_sub(held);

    active
        .iter()
        .filter(|e| e.current().is_queued())
        .take(free)
        .map(|e| e.with_state(StateType::Running))
        .collect()
}

/// Applies flow concurrency limits to submissions and releases.
#[derive(Clone)]
pub struct ConcurrencyController {
    repository: Arc<dyn ExecutionRepository>,
}

impl ConcurrencyController {
    pub fn new(repository: Arc<dyn ExecutionRepository>) -> Self {
        Self { repository }
    }

    /// Persist a new execution in its admission state: RUNNING under the
    /// limit, otherwise CANCELLED, FAILED or QUEUED per the flow's policy.
    /// Without a concurrency setting it is stored as given.
    pub async fn admit(&self, execution: Execution, flow: &Flow) -> AppResult<Execution> {
        let flow_key = flow.key();
        let candidate_id = execution.id.clone();

        let mut upserts = self
            .repository
            .lock_flow(
                &flow_key,
                Box::new(move |active: Vec<Execution>| {
                    let others: Vec<Execution> = active
                        .into_iter()
                        .filter(|e| e.id != execution.id)
                        .collect();
                    let admitted = match admission_state(flow, &others) {
                        Some(state) => execution.with_state(state),
                        None => execution,
                    };
                    debug!(
                        execution_id = %admitted.id,
                        active = others.len(),
                        state = %admitted.current(),
                        "Admission decided"
                    );
                    Ok(vec![admitted])
                }),
            )
            .await?;

        let admitted = upserts.pop().ok_or_else(|| {
            AppError::Internal(format!(
                "Admission of execution '{}' returned nothing",
                candidate_id
            ))
        })?;

        info!(
            execution_id = %admitted.id,
            flow = %flow_key,
            state = %admitted.current(),
            "Execution admitted"
        );
        Ok(admitted)
    }

    /// Start queued executions while the flow has free slots. Returns the
    /// executions moved to RUNNING.
    pub async fn release(&self, flow: &Flow) -> AppResult<Vec<Execution>> {
        let flow_key = flow.key();
        let started = self
            .repository
            .lock_flow(
                &flow_key,
                Box::new(move |active: Vec<Execution>| Ok(dequeue(flow, &active))),
            )
            .await?;

        for execution in &started {
            info!(execution_id = %execution.id, flow = %flow_key, "Queued execution dequeued");
        }
        Ok(started)
    }

    /// Take a queued execution out of the queue. It starts RUNNING past the
    /// limit when `state` is absent, otherwise it settles in the given final
    /// state. Anything not currently queued is rejected.
    pub async fn unqueue(
        &self,
        execution_id: &str,
        flow: &Flow,
        state: Option<StateType>,
    ) -> AppResult<Execution> {
        let target = state.unwrap_or(StateType::Running);
        if target != StateType::Running && !target.is_terminal() {
            return Err(AppError::Validation(format!(
                "A queued execution leaves the queue to RUNNING or a final state, got {}",
                target
            )));
        }

        let flow_key = flow.key();
        let mut upserts = self
            .repository
            .lock_flow(
                &flow_key,
                Box::new(move |active: Vec<Execution>| {
                    let queued = active
                        .into_iter()
                        .find(|e| e.id == execution_id)
                        .ok_or_else(|| {
                            AppError::NotFound(format!("Active execution '{}'", execution_id))
                        })?;
                    if !queued.current().is_queued() {
                        return Err(AppError::invalid_state(
                            &queued.id,
                            queued.current(),
                            target,
                        ));
                    }
                    Ok(vec![queued.with_state(target)])
                }),
            )
            .await?;

        let unqueued = upserts.pop().ok_or_else(|| {
            AppError::Internal(format!("Unqueue of execution '{}' returned nothing", execution_id))
        })?;
        info!(
            execution_id = %unqueued.id,
            flow = %flow_key,
            state = %unqueued.current(),
            "Execution unqueued"
        );
        Ok(unqueued)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::db::memory::MemoryExecutionRepository;
    use crate::test_support::*;

    const LIMITED_FLOW: &str = r#"
id: limited
namespace: company.team
concurrency:
  limit: 1
  behavior: QUEUE
tasks:
  - id: only
    type: task
"#;

    fn limited(behavior: &str) -> Flow {
        flow(&LIMITED_FLOW.replace("QUEUE", behavior))
    }

    fn controller() -> (ConcurrencyController, Arc<MemoryExecutionRepository>) {
        let repository = Arc::new(MemoryExecutionRepository::new(Duration::from_secs(5)));
        (ConcurrencyController::new(repository.clone()), repository)
    }

    #[tokio::test]
    async fn test_queue_admission_and_release() {
        let (controller, repository) = controller();
        let flow = limited("QUEUE");

        let first = controller.admit(Execution::for_flow(&flow), &flow).await.unwrap();
        let second = controller.admit(Execution::for_flow(&flow), &flow).await.unwrap();
        let third = controller.admit(Execution::for_flow(&flow), &flow).await.unwrap();
        assert_eq!(first.current(), Running);
        assert_eq!(second.current(), Queued);
        assert_eq!(third.current(), Queued);

        // nothing to start while the first one holds the slot
        assert!(controller.release(&flow).await.unwrap().is_empty());

        repository
            .save(&first.with_state(Success))
            .await
            .unwrap();
        let started = controller.release(&flow).await.unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].id, second.id);
        assert_eq!(
            started[0].state.history_types(),
            vec![Created, Queued, Running]
        );

        let stored = repository.find_by_id(&third.id).await.unwrap().unwrap();
        assert_eq!(stored.current(), Queued);
    }

    #[tokio::test]
    async fn test_cancel_policy() {
        let (controller, _) = controller();
        let flow = limited("CANCEL");

        controller.admit(Execution::for_flow(&flow), &flow).await.unwrap();
        let rejected = controller.admit(Execution::for_flow(&flow), &flow).await.unwrap();

        assert_eq!(rejected.current(), Cancelled);
        assert_eq!(rejected.state.history_types(), vec![Created, Cancelled]);
    }

    #[tokio::test]
    async fn test_fail_policy() {
        let (controller, _) = controller();
        let flow = limited("FAIL");

        controller.admit(Execution::for_flow(&flow), &flow).await.unwrap();
        let rejected =
            tokio_test::assert_ok!(controller.admit(Execution::for_flow(&flow), &flow).await);
        assert_eq!(rejected.current(), Failed);
    }

    #[tokio::test]
    async fn test_paused_execution_holds_slot() {
        let (controller, repository) = controller();
        let flow = limited("QUEUE");

        let first = controller.admit(Execution::for_flow(&flow), &flow).await.unwrap();
        repository.save(&first.with_state(Paused)).await.unwrap();

        let second = controller.admit(Execution::for_flow(&flow), &flow).await.unwrap();
        assert_eq!(second.current(), Queued);
    }

    #[tokio::test]
    async fn test_no_concurrency_stores_as_given() {
        let (controller, repository) = controller();
        let flow = flow(LINEAR_FLOW);

        let admitted = controller.admit(Execution::for_flow(&flow), &flow).await.unwrap();
        assert_eq!(admitted.current(), Created);
        assert!(repository.find_by_id(&admitted.id).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_respect_limit() {
        let (controller, _) = controller();
        let flow = Arc::new(limited("QUEUE"));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let controller = controller.clone();
            let flow = flow.clone();
            handles.push(tokio::spawn(async move {
                controller
                    .admit(Execution::for_flow(&flow), &flow)
                    .await
                    .unwrap()
            }));
        }

        let mut running = 0;
        for handle in handles {
            if handle.await.unwrap().current() == Running {
                running += 1;
            }
        }
        assert_eq!(running, 1);
    }

    #[tokio::test]
    async fn test_unqueue_forces_run_past_limit() {
        let (controller, repository) = controller();
        let flow = limited("QUEUE");

        let first = controller.admit(Execution::for_flow(&flow), &flow).await.unwrap();
        let second = controller.admit(Execution::for_flow(&flow), &flow).await.unwrap();
        let third = controller.admit(Execution::for_flow(&flow), &flow).await.unwrap();

        let forced = controller.unqueue(&second.id, &flow, None).await.unwrap();
        assert_eq!(forced.state.history_types(), vec![Created, Queued, Running]);

        let cancelled = controller
            .unqueue(&third.id, &flow, Some(Cancelled))
            .await
            .unwrap();
        assert_eq!(cancelled.current(), Cancelled);
        let stored = repository.find_by_id(&third.id).await.unwrap().unwrap();
        assert_eq!(stored.current(), Cancelled);

        assert!(matches!(
            controller.unqueue(&first.id, &flow, None).await,
            Err(AppError::InvalidState { actual: Running, .. })
        ));
        assert!(matches!(
            controller.unqueue(&third.id, &flow, None).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unqueue_rejects_non_final_target() {
        let (controller, _) = controller();
        let flow = limited("QUEUE");
        controller.admit(Execution::for_flow(&flow), &flow).await.unwrap();
        let queued = controller.admit(Execution::for_flow(&flow), &flow).await.unwrap();

        assert!(matches!(
            controller.unqueue(&queued.id, &flow, Some(Paused)).await,
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_dequeue_respects_free_slots() {
        let flow = flow(&LIMITED_FLOW.replace("limit: 1", "limit: 2"));
        let running = Execution::for_flow(&flow).with_state(Running);
        let queued: Vec<Execution> = (0..3)
            .map(|_| Execution::for_flow(&flow).with_state(Queued))
            .collect();

        let mut active = vec![running];
        active.extend(queued.iter().cloned());

        let started = dequeue(&flow, &active);
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].id, queued[0].id);
    }
}
