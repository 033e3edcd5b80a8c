//! Handler registration.
//!
//! Exactly one handler per queue. The handler's queue options (concurrency,
//! batch size, timeout, retry policy) travel with it into the dispatcher.

use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use fediq_core::{JobId, QueueName};
use fediq_jobs::{HandlerError, Job, RetryPolicy};

/// What a handler knows about the job it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub id: JobId,
    pub queue: QueueName,
    /// 1 on the first run, `retry_count + 1` afterwards.
    pub attempt: u32,
    pub queued_at: DateTime<Utc>,
}

impl JobContext {
    pub fn for_job(job: &Job) -> Self {
        Self {
            id: job.id(),
            queue: job.queue().clone(),
            attempt: job.retry_count().saturating_add(1),
            queued_at: job.queued_at(),
        }
    }
}

/// Consumer of one queue's payloads.
///
/// Execution is at-least-once: a job may run again after a crash, a timeout or
/// a lost completion write, so handlers must be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext, data: Vec<u8>) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext, data: Vec<u8>) -> Result<(), HandlerError> {
        (self)(ctx, data).await
    }
}

/// Adapter for handlers that take a JSON-decoded payload.
///
/// A payload that does not decode into `T` fails permanently; retrying would
/// not change the bytes.
pub struct JsonHandler<T, F> {
    f: F,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F> JsonHandler<T, F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> JobHandler for JsonHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(JobContext, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext, data: Vec<u8>) -> Result<(), HandlerError> {
        let payload: T = serde_json::from_slice(&data).map_err(|e| {
            HandlerError::permanent(format!("payload is not valid JSON for this queue: {e}"))
                .with_origin("payload.decode")
        })?;
        (self.f)(ctx, payload).await
    }
}

/// Per-queue execution settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    /// Maximum jobs of this queue running at once in this process.
    pub concurrency: usize,
    /// Maximum jobs claimed per store round trip.
    pub max_batch: usize,
    /// Wall-clock limit for one handler run.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_batch: 16,
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("concurrency must be at least 1".to_string());
        }
        if self.max_batch == 0 {
            return Err("max_batch must be at least 1".to_string());
        }
        if self.timeout.is_zero() {
            return Err("timeout must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Registration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("a handler is already registered for queue {0}")]
    DuplicateQueue(QueueName),

    #[error("invalid queue name: {0}")]
    InvalidQueue(String),

    #[error("invalid options for queue {queue}: {reason}")]
    InvalidOptions { queue: QueueName, reason: String },
}

/// A handler bound to its queue.
#[derive(Clone)]
pub struct Registration {
    pub queue: QueueName,
    pub handler: Arc<dyn JobHandler>,
    pub options: QueueOptions,
}

impl core::fmt::Debug for Registration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registration")
            .field("queue", &self.queue)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Queue name to handler map.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    entries: BTreeMap<QueueName, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(
        &mut self,
        queue: impl AsRef<str>,
        handler: H,
        options: QueueOptions,
    ) -> Result<(), RegistryError>
    where
        H: JobHandler,
    {
        let queue = QueueName::new(queue.as_ref())
            .map_err(|e| RegistryError::InvalidQueue(e.to_string()))?;
        options
            .validate()
            .map_err(|reason| RegistryError::InvalidOptions {
                queue: queue.clone(),
                reason,
            })?;
        if self.entries.contains_key(&queue) {
            return Err(RegistryError::DuplicateQueue(queue));
        }

        self.entries.insert(
            queue.clone(),
            Registration {
                queue,
                handler: Arc::new(handler),
                options,
            },
        );
        Ok(())
    }

    pub fn get(&self, queue: &QueueName) -> Option<&Registration> {
        self.entries.get(queue)
    }

    pub fn queues(&self) -> impl Iterator<Item = &QueueName> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_registrations(self) -> impl Iterator<Item = Registration> {
        self.entries.into_values()
    }
}
