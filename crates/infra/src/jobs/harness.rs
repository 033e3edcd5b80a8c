//! Worker harness: runs one claimed job to a recorded outcome.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use fediq_jobs::{HandlerError, Job, RetryDecision};

use super::registry::{JobContext, Registration};
use super::store::JobStore;

/// How the handler run ended, before retry policy is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// The handler returned an error.
    Handler,
    Panic,
    Timeout,
}

/// What the harness recorded for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// Parked as `Delayed` for another attempt.
    Retrying { delay: Duration, cause: FailureCause },
    /// Terminal failure.
    Failed { cause: FailureCause },
    /// No outcome was written: either the write failed (the job stays
    /// `Running` until the sweeper requeues it) or the claim was lost to the
    /// sweeper mid-run and the handler was aborted.
    Unrecorded,
}

impl JobOutcome {
    pub fn cause(&self) -> Option<FailureCause> {
        match self {
            JobOutcome::Retrying { cause, .. } | JobOutcome::Failed { cause } => Some(*cause),
            JobOutcome::Succeeded | JobOutcome::Unrecorded => None,
        }
    }
}

/// Aborts the handler task if the harness itself is dropped or aborted.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs handlers for one queue against a store.
#[derive(Clone)]
pub struct WorkerHarness {
    store: Arc<dyn JobStore>,
    registration: Registration,
    heartbeat_interval: Duration,
}

impl WorkerHarness {
    pub fn new(
        store: Arc<dyn JobStore>,
        registration: Registration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            store,
            registration,
            heartbeat_interval,
        }
    }

    /// Run `job` (already `Running`) and record the outcome in the store.
    ///
    /// The handler runs on its own task. While it runs the job's heartbeat is
    /// refreshed every `heartbeat_interval`; past the queue timeout the task is
    /// aborted and the run counts as a retryable failure. If a heartbeat finds
    /// the job no longer `Running`, the handler is aborted and nothing is
    /// recorded.
    pub async fn run(&self, job: Job) -> JobOutcome {
        let id = job.id();
        let queue = job.queue().clone();
        let timeout = self.registration.options.timeout;
        let ctx = JobContext::for_job(&job);
        let handler = Arc::clone(&self.registration.handler);
        let data = job.data().to_vec();

        debug!(%queue, job_id = %id, attempt = ctx.attempt, "running job");

        let mut task = AbortOnDrop(tokio::spawn(async move { handler.handle(ctx, data).await }));
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The claim itself set the first heartbeat.
        heartbeat.tick().await;

        let finished = loop {
            tokio::select! {
                joined = &mut task.0 => {
                    break Some(match joined {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(err)) => Err((err, FailureCause::Handler)),
                        Err(join_err) if join_err.is_panic() => {
                            let detail = panic_detail(join_err.into_panic());
                            Err((HandlerError::panicked(detail), FailureCause::Panic))
                        }
                        Err(_) => Err((
                            HandlerError::retryable("handler task was cancelled"),
                            FailureCause::Handler,
                        )),
                    });
                }
                _ = &mut deadline => {
                    task.0.abort();
                    break Some(Err((HandlerError::timed_out(timeout), FailureCause::Timeout)));
                }
                _ = heartbeat.tick() => {
                    match self.store.heartbeat(id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            // Requeued by the sweeper; another worker may own it now.
                            task.0.abort();
                            break None;
                        }
                        Err(err) => warn!(%queue, job_id = %id, error = %err, "failed to refresh heartbeat"),
                    }
                }
            }
        };

        match finished {
            Some(Ok(())) => self.record_success(&job).await,
            Some(Err((err, cause))) => self.record_failure(&job, err, cause).await,
            None => {
                warn!(%queue, job_id = %id, "claim lost while running; handler aborted");
                JobOutcome::Unrecorded
            }
        }
    }

    async fn record_success(&self, job: &Job) -> JobOutcome {
        match self.store.complete(job.id()).await {
            Ok(_) => {
                debug!(queue = %job.queue(), job_id = %job.id(), "job completed");
                JobOutcome::Succeeded
            }
            Err(err) => {
                error!(queue = %job.queue(), job_id = %job.id(), error = %err, "failed to record completion");
                JobOutcome::Unrecorded
            }
        }
    }

    async fn record_failure(&self, job: &Job, err: HandlerError, cause: FailureCause) -> JobOutcome {
        let decision = self.registration.options.retry.decide(job.retry_count(), &err);

        if let Err(store_err) = self.store.fail(job.id(), err.to_exception(), decision).await {
            error!(
                queue = %job.queue(),
                job_id = %job.id(),
                error = %store_err,
                handler_error = %err,
                "failed to record job failure"
            );
            return JobOutcome::Unrecorded;
        }

        match decision {
            RetryDecision::Retry { delay } => {
                info!(
                    queue = %job.queue(),
                    job_id = %job.id(),
                    retry_count = job.retry_count() + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    source = err.origin().unwrap_or(""),
                    "job failed; retry scheduled"
                );
                JobOutcome::Retrying { delay, cause }
            }
            RetryDecision::Terminal => {
                warn!(
                    queue = %job.queue(),
                    job_id = %job.id(),
                    retry_count = job.retry_count(),
                    error = %err,
                    source = err.origin().unwrap_or(""),
                    "job failed permanently"
                );
                JobOutcome::Failed { cause }
            }
        }
    }
}

fn panic_detail(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
