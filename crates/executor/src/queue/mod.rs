//! Message queues between the API, the executor and workers.
//!
//! Two channels are used:
//! - executions: every persisted execution change, consumed by the executor
//!   loop and by callers awaiting an outcome
//! - worker jobs: task runs handed to workers
//!
//! Subscriptions are live only: a subscriber sees messages emitted after
//! `subscribe` returned.

pub mod memory;
pub mod nats;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::engine::execution::Execution;
use crate::error::{AppError, AppResult};

pub use memory::MemoryQueue;
pub use nats::NatsQueue;

/// Subject of execution changes.
pub const EXECUTIONS_SUBJECT: &str = "flowrun.executions";

/// Subject of worker jobs.
pub const WORKER_JOBS_SUBJECT: &str = "flowrun.jobs";

/// Subscription filter.
pub type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Publish/subscribe channel of `T`.
#[async_trait]
pub trait Queue<T>: Send + Sync
where
    T: Send + 'static,
{
    async fn emit(&self, message: T) -> AppResult<()>;

    /// Messages emitted from now on that satisfy `predicate`.
    async fn subscribe(&self, predicate: Predicate<T>) -> AppResult<BoxStream<'static, T>>;

    /// Resolves once a subscriber of this queue dropped messages, so the
    /// consumer can rescan storage. Queues that never drop never resolve.
    async fn lagged(&self) {
        futures::future::pending::<()>().await
    }
}

/// Next message of a subscription, bounded by `timeout`.
pub async fn next_within<T>(stream: &mut BoxStream<'static, T>, timeout: Duration) -> AppResult<T> {
    match tokio::time::timeout(timeout, stream.next()).await {
        Ok(Some(message)) => Ok(message),
        Ok(None) => Err(AppError::Internal("Queue subscription closed".to_string())),
        Err(_) => Err(AppError::Internal(format!(
            "No matching message within {} ms",
            timeout.as_millis()
        ))),
    }
}

/// Wait for the first emitted state of an execution satisfying `predicate`.
pub async fn await_execution(
    queue: &dyn Queue<Execution>,
    execution_id: &str,
    predicate: impl Fn(&Execution) -> bool + Send + Sync + 'static,
    timeout: Duration,
) -> AppResult<Execution> {
    let id = execution_id.to_string();
    let mut stream = queue
        .subscribe(Box::new(move |execution: &Execution| {
            execution.id == id && predicate(execution)
        }))
        .await?;
    next_within(&mut stream, timeout).await
}
