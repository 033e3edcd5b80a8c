//! Handler failure taxonomy and the diagnostic captured on a job.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Origin recorded when a handler exceeds its timeout.
pub const ORIGIN_TIMEOUT: &str = "worker.timeout";
/// Origin recorded when a handler panics.
pub const ORIGIN_PANIC: &str = "worker.panic";
/// Origin recorded when the recovery sweeper reclaims an orphaned job.
pub const ORIGIN_RECOVERY: &str = "recovery_sweeper";

/// Whether a failed attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient; subject to the retry policy.
    Retryable,
    /// Never retried, whatever the retry count.
    Permanent,
}

/// Error returned by a job handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    kind: FailureKind,
    message: String,
    origin: Option<String>,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
            origin: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
            origin: None,
        }
    }

    /// Synthesized failure for a handler that ran past its timeout.
    pub fn timed_out(after: Duration) -> Self {
        Self::retryable(format!("handler timed out after {}ms", after.as_millis()))
            .with_origin(ORIGIN_TIMEOUT)
    }

    /// Synthesized failure for a handler that panicked.
    pub fn panicked(detail: impl AsRef<str>) -> Self {
        Self::retryable(format!("handler panicked: {}", detail.as_ref())).with_origin(ORIGIN_PANIC)
    }

    /// Tag where the failure came from (module, remote host, exception type...).
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// The diagnostic persisted on the job row.
    pub fn to_exception(&self) -> JobException {
        JobException {
            message: self.message.clone(),
            source: self.origin.clone(),
        }
    }
}

/// Most recent failure of a job (`exception_message` / `exception_source`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobException {
    pub message: String,
    pub source: Option<String>,
}

impl JobException {
    pub fn new(message: impl Into<String>, source: Option<String>) -> Self {
        Self {
            message: message.into(),
            source,
        }
    }
}
