//! In-process queue over a tokio broadcast channel.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Notify;

use super::{Predicate, Queue};
use crate::error::AppResult;

/// Broadcast queue: every subscriber sees every message.
///
/// A subscriber that falls more than `capacity` messages behind loses the
/// oldest ones; the loss is signalled through [`Queue::lagged`].
#[derive(Debug, Clone)]
pub struct MemoryQueue<T> {
    sender: broadcast::Sender<T>,
    lag: Arc<Notify>,
}

impl<T: Clone + Send + 'static> MemoryQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            lag: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl<T> Queue<T> for MemoryQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn emit(&self, message: T) -> AppResult<()> {
        // no subscriber is not an error
        let _ = self.sender.send(message);
        Ok(())
    }

    async fn subscribe(&self, predicate: Predicate<T>) -> AppResult<BoxStream<'static, T>> {
        let receiver = self.sender.subscribe();
        let lag = self.lag.clone();

        let messages = stream::unfold((receiver, lag), |(mut receiver, lag)| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, (receiver, lag))),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Queue subscriber lagged, messages dropped");
                        lag.notify_one();
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(messages
            .filter(move |message| futures::future::ready(predicate(message)))
            .boxed())
    }

    async fn lagged(&self) {
        self.lag.notified().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_later_messages() {
        let queue = MemoryQueue::<u32>::new(8);
        queue.emit(1).await.unwrap();

        let mut evens = queue.subscribe(Box::new(|n| n % 2 == 0)).await.unwrap();
        let mut all = queue.subscribe(Box::new(|_| true)).await.unwrap();

        for n in 2..=4 {
            queue.emit(n).await.unwrap();
        }

        assert_eq!(evens.next().await, Some(2));
        assert_eq!(evens.next().await, Some(4));
        assert_eq!(all.next().await, Some(2));
        assert_eq!(all.next().await, Some(3));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_signals_loss() {
        let queue = MemoryQueue::<u32>::new(2);
        let mut slow = queue.subscribe(Box::new(|_| true)).await.unwrap();

        for n in 1..=5 {
            queue.emit(n).await.unwrap();
        }

        // the oldest messages are gone, the newest still arrive
        assert_eq!(slow.next().await, Some(4));
        tokio_test::assert_ok!(
            tokio::time::timeout(Duration::from_millis(100), queue.lagged()).await
        );
    }

    #[tokio::test]
    async fn test_no_loss_no_signal() {
        let queue = MemoryQueue::<u32>::new(8);
        let mut all = queue.subscribe(Box::new(|_| true)).await.unwrap();
        queue.emit(1).await.unwrap();
        assert_eq!(all.next().await, Some(1));

        assert!(tokio::time::timeout(Duration::from_millis(50), queue.lagged())
            .await
            .is_err());
    }
}
