//! NATS queue.
//!
//! Messages are published through JetStream, so they are retained by a stream
//! for late consumers such as workers, and acknowledged before `emit`
//! returns. Subscriptions use a core NATS subscription on the same subject:
//! they only see messages published after they subscribed.

use std::marker::PhantomData;
use std::time::Duration;

use async_nats::jetstream::{self, Context};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Predicate, Queue};
use crate::error::{AppError, AppResult};

/// Retention of the backing stream.
const STREAM_MAX_AGE: Duration = Duration::from_secs(3600);

/// Stream name for a subject: `flowrun.jobs` is stored in `flowrun_jobs`.
pub fn stream_name(subject: &str) -> String {
    subject.replace(['.', '*', '>'], "_")
}

/// Queue of JSON messages on one NATS subject.
pub struct NatsQueue<T> {
    client: async_nats::Client,
    js: Context,
    subject: String,
    _message: PhantomData<fn() -> T>,
}

impl<T> Clone for NatsQueue<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            js: self.js.clone(),
            subject: self.subject.clone(),
            _message: PhantomData,
        }
    }
}

impl<T> NatsQueue<T> {
    /// Create a queue on `subject`, creating its JetStream stream if needed.
    pub async fn new(client: async_nats::Client, subject: &str) -> AppResult<Self> {
        let js = jetstream::new(client.clone());
        Self::ensure_stream(&js, &stream_name(subject), subject).await?;

        Ok(Self {
            client,
            js,
            subject: subject.to_string(),
            _message: PhantomData,
        })
    }

    async fn ensure_stream(js: &Context, stream: &str, subject: &str) -> AppResult<()> {
        match js.get_stream(stream).await {
            Ok(_) => {
                tracing::debug!(stream = %stream, "Using existing NATS stream");
                Ok(())
            }
            Err(_) => {
                let config = jetstream::stream::Config {
                    name: stream.to_string(),
                    subjects: vec![subject.to_string()],
                    max_age: STREAM_MAX_AGE,
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                };

                js.create_stream(config)
                    .await
                    .map_err(|e| AppError::Nats(e.to_string()))?;

                tracing::info!(stream = %stream, subject = %subject, "Created NATS stream");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<T> Queue<T> for NatsQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn emit(&self, message: T) -> AppResult<()> {
        let payload = serde_json::to_vec(&message)?;

        self.js
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| AppError::Nats(e.to_string()))?
            .await
            .map_err(|e| AppError::Nats(e.to_string()))?;

        tracing::trace!(subject = %self.subject, "Published message");
        Ok(())
    }

    async fn subscribe(&self, predicate: Predicate<T>) -> AppResult<BoxStream<'static, T>> {
        let subscriber = self
            .client
            .subscribe(self.subject.clone())
            .await
            .map_err(|e| AppError::Nats(e.to_string()))?;
        let subject = self.subject.clone();

        Ok(subscriber
            .filter_map(move |message| {
                let decoded = match serde_json::from_slice::<T>(&message.payload) {
                    Ok(decoded) if predicate(&decoded) => Some(decoded),
                    Ok(_) => None,
                    Err(e) => {
                        tracing::warn!(subject = %subject, error = %e, "Dropping undecodable message");
                        None
                    }
                };
                futures::future::ready(decoded)
            })
            .boxed())
    }
}
