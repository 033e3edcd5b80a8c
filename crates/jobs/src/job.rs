//! The job entity and its state machine.
//!
//! ```text
//! Queued   --claim-->                      Running
//! Delayed  --claim (if due)-->             Running
//! Running  --success-->                    Completed
//! Running  --retryable fail-->             Delayed
//! Running  --terminal fail/max retries-->  Failed
//! Running  --orphan recovery-->            Queued
//! ```
//!
//! Per-state data lives inside [`JobState`], so a completed job cannot carry a
//! `delayed_until` and a queued job cannot carry a heartbeat. [`JobRecord`] is
//! the flat, column-shaped view used by stores; converting it back into a
//! [`Job`] re-checks every invariant.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fediq_core::{DomainError, JobId, QueueName};

use crate::failure::{JobException, ORIGIN_RECOVERY};
use crate::retry::RetryDecision;

/// Flat job status, as persisted and as used in filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Delayed,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Delayed,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Delayed => "delayed",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "delayed" => Ok(JobStatus::Delayed),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Status together with the data that only exists in that status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Delayed { until: DateTime<Utc> },
    Running { heartbeat_at: DateTime<Utc> },
    Completed { finished_at: DateTime<Utc> },
    Failed { finished_at: DateTime<Utc> },
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Queued => JobStatus::Queued,
            JobState::Delayed { .. } => JobStatus::Delayed,
            JobState::Running { .. } => JobStatus::Running,
            JobState::Completed { .. } => JobStatus::Completed,
            JobState::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn delayed_until(&self) -> Option<DateTime<Utc>> {
        match self {
            JobState::Delayed { until } => Some(*until),
            _ => None,
        }
    }

    pub fn heartbeat_at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobState::Running { heartbeat_at } => Some(*heartbeat_at),
            _ => None,
        }
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobState::Completed { finished_at } | JobState::Failed { finished_at } => {
                Some(*finished_at)
            }
            _ => None,
        }
    }
}

/// A transition that the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot {operation} job {id}: status is {from}")]
    Invalid {
        id: JobId,
        from: JobStatus,
        operation: &'static str,
    },

    #[error("job {id} is delayed until {until}")]
    NotDue { id: JobId, until: DateTime<Utc> },
}

/// A persisted unit of asynchronous work.
///
/// Fields are private: the transition methods are the only way to change a
/// job, and each one matches exhaustively on the current state. Serde goes
/// through [`JobRecord`], so deserialized jobs are checked like stored rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "JobRecord", into = "JobRecord")]
pub struct Job {
    id: JobId,
    queue: QueueName,
    state: JobState,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    retry_count: u32,
    exception: Option<JobException>,
    data: Vec<u8>,
}

impl Job {
    /// A fresh job: `Queued`, or `Delayed` when a non-zero delay is given.
    pub fn new(
        queue: QueueName,
        data: Vec<u8>,
        delay: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let state = match delay.filter(|d| !d.is_zero()) {
            None => JobState::Queued,
            Some(d) => {
                let until = chrono::Duration::from_std(d)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .ok_or_else(|| DomainError::validation(format!("delay {d:?} is out of range")))?;
                JobState::Delayed { until }
            }
        };

        Ok(Self {
            id: JobId::new(),
            queue,
            state,
            queued_at: now,
            started_at: None,
            retry_count: 0,
            exception: None,
            data,
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn queued_at(&self) -> DateTime<Utc> {
        self.queued_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state.finished_at()
    }

    pub fn delayed_until(&self) -> Option<DateTime<Utc>> {
        self.state.delayed_until()
    }

    pub fn heartbeat_at(&self) -> Option<DateTime<Utc>> {
        self.state.heartbeat_at()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn exception(&self) -> Option<&JobException> {
        self.exception.as_ref()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether a claim at `now` would succeed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Queued => true,
            JobState::Delayed { until } => until <= now,
            JobState::Running { .. } | JobState::Completed { .. } | JobState::Failed { .. } => false,
        }
    }

    /// Whether the job is `Running` with a heartbeat older than `liveness_timeout`.
    pub fn is_orphaned(&self, now: DateTime<Utc>, liveness_timeout: Duration) -> bool {
        let Some(heartbeat_at) = self.state.heartbeat_at() else {
            return false;
        };
        match chrono::Duration::from_std(liveness_timeout) {
            Ok(timeout) => heartbeat_at < now - timeout,
            Err(_) => false,
        }
    }

    fn invalid(&self, operation: &'static str) -> TransitionError {
        TransitionError::Invalid {
            id: self.id,
            from: self.status(),
            operation,
        }
    }

    /// `Queued | Delayed (due) -> Running`.
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.state {
            JobState::Queued => {}
            JobState::Delayed { until } if until <= now => {}
            JobState::Delayed { until } => {
                return Err(TransitionError::NotDue { id: self.id, until });
            }
            JobState::Running { .. } | JobState::Completed { .. } | JobState::Failed { .. } => {
                return Err(self.invalid("claim"));
            }
        }
        self.state = JobState::Running { heartbeat_at: now };
        self.started_at.get_or_insert(now);
        Ok(())
    }

    /// Refresh the liveness signal of a running job.
    pub fn heartbeat(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.state {
            JobState::Running { .. } => {
                self.state = JobState::Running { heartbeat_at: now };
                Ok(())
            }
            JobState::Queued
            | JobState::Delayed { .. }
            | JobState::Completed { .. }
            | JobState::Failed { .. } => Err(self.invalid("heartbeat")),
        }
    }

    /// `Running -> Completed`.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.state {
            JobState::Running { .. } => {
                self.state = JobState::Completed { finished_at: now };
                Ok(())
            }
            JobState::Queued
            | JobState::Delayed { .. }
            | JobState::Completed { .. }
            | JobState::Failed { .. } => Err(self.invalid("complete")),
        }
    }

    /// `Running -> Delayed` (retry) or `Running -> Failed` (terminal).
    pub fn fail(
        &mut self,
        now: DateTime<Utc>,
        exception: JobException,
        decision: RetryDecision,
    ) -> Result<(), TransitionError> {
        match self.state {
            JobState::Running { .. } => {}
            JobState::Queued
            | JobState::Delayed { .. }
            | JobState::Completed { .. }
            | JobState::Failed { .. } => return Err(self.invalid("fail")),
        }

        self.state = match decision {
            RetryDecision::Retry { delay } => {
                let until = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                self.retry_count = self.retry_count.saturating_add(1);
                JobState::Delayed { until }
            }
            RetryDecision::Terminal => JobState::Failed { finished_at: now },
        };
        self.exception = Some(exception);
        Ok(())
    }

    /// `Running -> Queued` after the owning worker stopped heartbeating.
    pub fn requeue_orphan(&mut self, liveness_timeout: Duration) -> Result<(), TransitionError> {
        match self.state {
            JobState::Running { .. } => {
                self.state = JobState::Queued;
                self.retry_count = self.retry_count.saturating_add(1);
                self.exception = Some(orphan_exception(liveness_timeout));
                Ok(())
            }
            JobState::Queued
            | JobState::Delayed { .. }
            | JobState::Completed { .. }
            | JobState::Failed { .. } => Err(self.invalid("requeue")),
        }
    }

    /// Flat, column-shaped copy of this job.
    pub fn to_record(&self) -> JobRecord {
        JobRecord::from(self.clone())
    }
}

/// Diagnostic written when the sweeper reclaims a job.
pub fn orphan_exception(liveness_timeout: Duration) -> JobException {
    JobException::new(
        format!(
            "worker stopped heartbeating for more than {}s; job requeued",
            liveness_timeout.as_secs()
        ),
        Some(ORIGIN_RECOVERY.to_string()),
    )
}

/// Flat representation of a job, one field per persisted column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: QueueName,
    pub status: JobStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub delayed_until: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub exception_message: Option<String>,
    pub exception_source: Option<String>,
    pub data: Vec<u8>,
}

impl From<Job> for JobRecord {
    fn from(job: Job) -> Self {
        let (message, source) = match job.exception {
            Some(e) => (Some(e.message), e.source),
            None => (None, None),
        };
        JobRecord {
            id: job.id,
            queue: job.queue,
            status: job.state.status(),
            queued_at: job.queued_at,
            started_at: job.started_at,
            finished_at: job.state.finished_at(),
            delayed_until: job.state.delayed_until(),
            heartbeat_at: job.state.heartbeat_at(),
            retry_count: job.retry_count,
            exception_message: message,
            exception_source: source,
            data: job.data,
        }
    }
}

impl TryFrom<JobRecord> for Job {
    type Error = DomainError;

    fn try_from(r: JobRecord) -> Result<Self, Self::Error> {
        let broken = |what: &str| {
            DomainError::validation(format!("job {} ({}) {}", r.id, r.status, what))
        };

        let state = match r.status {
            JobStatus::Queued => JobState::Queued,
            JobStatus::Delayed => JobState::Delayed {
                until: r.delayed_until.ok_or_else(|| broken("has no delayed_until"))?,
            },
            JobStatus::Running => JobState::Running {
                heartbeat_at: r.heartbeat_at.ok_or_else(|| broken("has no heartbeat_at"))?,
            },
            JobStatus::Completed => JobState::Completed {
                finished_at: r.finished_at.ok_or_else(|| broken("has no finished_at"))?,
            },
            JobStatus::Failed => JobState::Failed {
                finished_at: r.finished_at.ok_or_else(|| broken("has no finished_at"))?,
            },
        };

        if r.status != JobStatus::Delayed && r.delayed_until.is_some() {
            return Err(broken("carries a delayed_until"));
        }
        if r.status != JobStatus::Running && r.heartbeat_at.is_some() {
            return Err(broken("carries a heartbeat_at"));
        }
        if !r.status.is_terminal() && r.finished_at.is_some() {
            return Err(broken("carries a finished_at"));
        }
        if matches!(
            r.status,
            JobStatus::Running | JobStatus::Completed | JobStatus::Failed
        ) && r.started_at.is_none()
        {
            return Err(broken("was never started"));
        }

        let exception = match (r.exception_message, r.exception_source) {
            (Some(message), source) => Some(JobException { message, source }),
            (None, None) => None,
            (None, Some(_)) => return Err(broken("has an exception source without a message")),
        };

        Ok(Job {
            id: r.id,
            queue: r.queue,
            state,
            queued_at: r.queued_at,
            started_at: r.started_at,
            retry_count: r.retry_count,
            exception,
            data: r.data,
        })
    }
}
