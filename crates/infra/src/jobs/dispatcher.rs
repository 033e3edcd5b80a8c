//! Per-queue dispatcher: claims eligible jobs and feeds them to workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use fediq_core::QueueName;

use crate::config::{ConfigError, require_nonzero};

use super::harness::{FailureCause, JobOutcome, WorkerHarness};
use super::registry::Registration;
use super::store::JobStore;

/// Dispatcher timing settings, shared by all queues of a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Fallback wait between claim attempts when no wake-up arrives.
    pub poll_interval: Duration,
    /// How often a running job's heartbeat is refreshed.
    pub heartbeat_interval: Duration,
    /// Wait after a failed claim before trying again.
    pub error_backoff: Duration,
    /// How long shutdown waits for in-flight jobs before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            error_backoff: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl DispatcherConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    /// Poll and heartbeat intervals must be non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero("dispatcher.poll_interval", self.poll_interval)?;
        require_nonzero("dispatcher.heartbeat_interval", self.heartbeat_interval)
    }
}

/// Dispatcher statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub claimed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub panicked: u64,
    /// Jobs currently held by a worker of this dispatcher.
    pub running: u64,
}

/// Live counters behind [`DispatcherStats`].
#[derive(Debug, Default)]
pub struct DispatcherCounters {
    claimed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    panicked: AtomicU64,
    running: AtomicU64,
}

impl DispatcherCounters {
    pub fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            claimed: self.claimed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: JobOutcome) {
        self.running.fetch_sub(1, Ordering::Relaxed);
        match outcome {
            JobOutcome::Succeeded => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            JobOutcome::Retrying { .. } => {
                self.retried.fetch_add(1, Ordering::Relaxed);
            }
            JobOutcome::Failed { .. } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            JobOutcome::Unrecorded => {}
        }
        match outcome.cause() {
            Some(FailureCause::Timeout) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
            }
            Some(FailureCause::Panic) => {
                self.panicked.fetch_add(1, Ordering::Relaxed);
            }
            Some(FailureCause::Handler) | None => {}
        }
    }
}

/// Claims jobs of one queue and runs them on a bounded worker pool.
pub struct Dispatcher {
    queue: QueueName,
    store: Arc<dyn JobStore>,
    harness: WorkerHarness,
    slots: Arc<Semaphore>,
    max_batch: usize,
    config: DispatcherConfig,
    wake: Arc<Notify>,
    counters: Arc<DispatcherCounters>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        registration: Registration,
        config: DispatcherConfig,
        wake: Arc<Notify>,
    ) -> Self {
        let queue = registration.queue.clone();
        let concurrency = registration.options.concurrency.max(1);
        let max_batch = registration.options.max_batch.max(1);
        let harness = WorkerHarness::new(
            Arc::clone(&store),
            registration,
            config.heartbeat_interval,
        );

        Self {
            queue,
            store,
            harness,
            slots: Arc::new(Semaphore::new(concurrency)),
            max_batch,
            config,
            wake,
            counters: Arc::new(DispatcherCounters::default()),
        }
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn counters(&self) -> Arc<DispatcherCounters> {
        Arc::clone(&self.counters)
    }

    /// Run until `shutdown` turns `true` (or its sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Err(err) = self.config.validate() {
            error!(queue = %self.queue, error = %err, "dispatcher not started");
            return;
        }
        info!(queue = %self.queue, concurrency = self.slots.available_permits(), "dispatcher started");
        let mut workers: JoinSet<()> = JoinSet::new();

        loop {
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }

            while let Some(joined) = workers.try_join_next() {
                self.reap(joined);
            }

            let capacity = self.slots.available_permits().min(self.max_batch);
            let mut claimed_full_batch = false;

            if capacity > 0 {
                match self.store.claim_batch(&self.queue, capacity).await {
                    Ok(jobs) => {
                        claimed_full_batch = jobs.len() == capacity;
                        if !jobs.is_empty() {
                            debug!(queue = %self.queue, count = jobs.len(), "claimed jobs");
                        }
                        for job in jobs {
                            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                                // Only this loop takes permits, so capacity was accurate.
                                error!(queue = %self.queue, job_id = %job.id(), "no worker slot for claimed job");
                                break;
                            };
                            self.counters.claimed.fetch_add(1, Ordering::Relaxed);
                            self.counters.running.fetch_add(1, Ordering::Relaxed);

                            let harness = self.harness.clone();
                            let counters = Arc::clone(&self.counters);
                            workers.spawn(async move {
                                let outcome = harness.run(job).await;
                                counters.record(outcome);
                                drop(permit);
                            });
                        }
                    }
                    Err(err) => {
                        error!(queue = %self.queue, error = %err, "failed to claim jobs");
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = tokio::time::sleep(self.config.error_backoff) => {}
                        }
                        continue;
                    }
                }
            }

            if claimed_full_batch && self.slots.available_permits() > 0 {
                continue;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.wake.notified() => {}
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    self.reap(joined);
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        self.drain(workers).await;
        info!(queue = %self.queue, "dispatcher stopped");
    }

    fn reap(&self, joined: Result<(), tokio::task::JoinError>) {
        if let Err(err) = joined {
            if err.is_panic() {
                error!(queue = %self.queue, "worker task panicked outside the handler");
            }
            self.counters.running.fetch_sub(1, Ordering::Relaxed);
        }
    }

    async fn drain(&self, mut workers: JoinSet<()>) {
        if workers.is_empty() {
            return;
        }

        info!(queue = %self.queue, in_flight = workers.len(), "waiting for in-flight jobs");
        let grace = self.config.shutdown_grace;
        let finished = tokio::time::timeout(grace, async {
            while let Some(joined) = workers.join_next().await {
                self.reap(joined);
            }
        })
        .await;

        if finished.is_err() {
            warn!(
                queue = %self.queue,
                aborted = workers.len(),
                "shutdown grace elapsed; aborting in-flight jobs (the sweeper will requeue them)"
            );
            workers.abort_all();
            while let Some(joined) = workers.join_next().await {
                self.reap(joined);
            }
        }
    }
}
