//! `fediq-jobs` — the job model.
//!
//! Pure, synchronous building blocks with no I/O: the job state machine, the
//! handler failure taxonomy and the retry policy. Stores and the runtime live
//! in `fediq-infra`.

pub mod failure;
pub mod job;
pub mod retry;

pub use failure::{
    FailureKind, HandlerError, JobException, ORIGIN_PANIC, ORIGIN_RECOVERY, ORIGIN_TIMEOUT,
};
pub use job::{Job, JobRecord, JobState, JobStatus, TransitionError, orphan_exception};
pub use retry::{RetryDecision, RetryPolicy};
