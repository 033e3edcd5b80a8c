//! Job store abstraction.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use fediq_core::{DomainError, JobId, QueueName};
use fediq_jobs::{Job, JobException, JobStatus, RetryDecision, TransitionError};

/// Persistent, transactional store of jobs.
///
/// Every method is atomic on its own: a claimed row is never handed to two
/// callers, and a failed write leaves no partial row behind. Implementations
/// read "now" from their own clock (process clock for the in-memory store,
/// database clock for Postgres).
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job, `Queued` or `Delayed` depending on `job.delay`.
    async fn enqueue(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Move up to `max` eligible jobs of `queue` to `Running`, oldest first.
    async fn claim_batch(&self, queue: &QueueName, max: usize) -> Result<Vec<Job>, StoreError>;

    /// `Running -> Completed`.
    async fn complete(&self, id: JobId) -> Result<Job, StoreError>;

    /// `Running -> Delayed` or `Running -> Failed`, recording `exception`.
    async fn fail(
        &self,
        id: JobId,
        exception: JobException,
        decision: RetryDecision,
    ) -> Result<Job, StoreError>;

    /// Refresh the heartbeat of a running job. `false` if it is no longer running.
    async fn heartbeat(&self, id: JobId) -> Result<bool, StoreError>;

    /// Reset every running job whose heartbeat is older than `liveness_timeout`.
    ///
    /// Returns the number of jobs put back into `Queued`.
    async fn requeue_orphaned(&self, liveness_timeout: Duration) -> Result<u64, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Jobs matching `filter`, oldest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Count of jobs per status in `queue`.
    async fn stats(&self, queue: &QueueName) -> Result<JobStats, StoreError>;

    /// Count of jobs per status, for every queue that has at least one job.
    async fn stats_by_queue(&self) -> Result<BTreeMap<QueueName, JobStats>, StoreError>;
}

/// A job to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub queue: QueueName,
    pub data: Vec<u8>,
    /// Absent or zero means "eligible immediately".
    pub delay: Option<Duration>,
}

impl NewJob {
    pub fn new(queue: QueueName, data: Vec<u8>) -> Self {
        Self {
            queue,
            data,
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The delay, with zero normalized to `None`.
    pub fn effective_delay(&self) -> Option<Duration> {
        self.delay.filter(|d| !d.is_zero())
    }

    /// `Validation` if `now + delay` is not a representable timestamp.
    pub fn check_delay(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let Some(delay) = self.effective_delay() else {
            return Ok(());
        };
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .map(|_| ())
            .ok_or_else(|| StoreError::Validation(format!("delay {delay:?} is out of range")))
    }
}

/// Selection for [`JobStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub queue: Option<QueueName>,
    pub status: Option<JobStatus>,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            queue: None,
            status: None,
            limit: 100,
        }
    }
}

impl JobFilter {
    pub fn queue(mut self, queue: QueueName) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.queue.as_ref().is_none_or(|q| q == job.queue())
            && self.status.is_none_or(|s| s == job.status())
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: u64,
    pub delayed: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobStats {
    pub fn add(&mut self, status: JobStatus, count: u64) {
        let slot = match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Delayed => &mut self.delayed,
            JobStatus::Running => &mut self.running,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
        };
        *slot += count;
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Queued => self.queued,
            JobStatus::Delayed => self.delayed,
            JobStatus::Running => self.running,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
        }
    }

    /// Jobs not yet in a terminal state.
    pub fn pending(&self) -> u64 {
        self.queued + self.delayed + self.running
    }

    pub fn total(&self) -> u64 {
        self.pending() + self.completed + self.failed
    }
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Connectivity, pool or lock failure; the operation may be retried.
    #[error("job store unavailable: {0}")]
    Unavailable(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("cannot {operation} job {id}: status is {from}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        operation: &'static str,
    },

    /// A persisted row violates the job invariants.
    #[error("corrupt job data: {0}")]
    Corrupt(String),

    #[error("validation failed: {0}")]
    Validation(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<TransitionError> for StoreError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::Invalid {
                id,
                from,
                operation,
            } => StoreError::InvalidTransition {
                id,
                from,
                operation,
            },
            TransitionError::NotDue { id, .. } => StoreError::InvalidTransition {
                id,
                from: JobStatus::Delayed,
                operation: "claim",
            },
        }
    }
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                StoreError::Validation(msg)
            }
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
