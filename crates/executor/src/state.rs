//! Application state shared by the HTTP handlers.

use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::db::ExecutionRepository;
use crate::engine::{ConditionEvaluator, Execution, WorkerJob};
use crate::flow::FlowRepository;
use crate::queue::Queue;
use crate::services::{ExecutionService, Executor};

/// Shared application state.
///
/// Cloned into every handler by axum; all members are shared handles.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Execution storage
    pub repository: Arc<dyn ExecutionRepository>,

    /// Flow registry
    pub flows: Arc<FlowRepository>,

    /// Execution change notifications
    pub execution_queue: Arc<dyn Queue<Execution>>,

    /// Restart, replay, markAs, kill, resume, delete
    pub executions: ExecutionService,

    /// Submissions and worker reports
    pub executor: Executor,

    /// NATS client, when the NATS queue is used
    pub nats: Option<async_nats::Client>,

    /// Server start time for uptime calculation
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        repository: Arc<dyn ExecutionRepository>,
        flows: Arc<FlowRepository>,
        execution_queue: Arc<dyn Queue<Execution>>,
        job_queue: Arc<dyn Queue<WorkerJob>>,
        evaluator: Arc<dyn ConditionEvaluator>,
        nats: Option<async_nats::Client>,
    ) -> Self {
        let executions =
            ExecutionService::new(repository.clone(), flows.clone(), execution_queue.clone());
        let executor = Executor::new(
            repository.clone(),
            flows.clone(),
            execution_queue.clone(),
            job_queue,
            evaluator,
        );

        Self {
            config: Arc::new(config),
            repository,
            flows,
            execution_queue,
            executions,
            executor,
            nats,
            start_time: Instant::now(),
        }
    }

    /// Get the server uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Check if NATS is configured and connected.
    pub fn has_nats(&self) -> bool {
        self.nats.is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use super::*;
    use crate::db::MemoryExecutionRepository;
    use crate::engine::DefaultConditionEvaluator;
    use crate::queue::MemoryQueue;

    /// In-memory state over the given flows.
    pub(crate) fn memory_state(flows: Arc<FlowRepository>) -> AppState {
        AppState::new(
            AppConfig::default(),
            Arc::new(MemoryExecutionRepository::new(Duration::from_secs(5))),
            flows,
            Arc::new(MemoryQueue::new(64)),
            Arc::new(MemoryQueue::new(64)),
            Arc::new(DefaultConditionEvaluator),
            None,
        )
    }

    #[test]
    fn test_uptime_starts_at_zero() {
        let state = memory_state(Arc::new(FlowRepository::new()));
        assert_eq!(state.uptime_seconds(), 0);
        assert!(!state.has_nats());
    }
}
