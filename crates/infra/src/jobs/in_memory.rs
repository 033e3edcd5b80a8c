//! In-memory job store for tests and development.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;

use fediq_core::{Clock, JobId, QueueName, SystemClock};
use fediq_jobs::{Job, JobException, RetryDecision};

use super::store::{JobFilter, JobStats, JobStore, NewJob, StoreError};

/// Job store backed by a map under a single lock.
///
/// Every operation runs in one critical section, which is what makes
/// `claim_batch` safe under concurrent callers. Time comes from the injected
/// [`Clock`], so delays and liveness timeouts can be driven by a
/// [`fediq_core::ManualClock`] in tests.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.jobs
            .read()
            .map_err(|_| StoreError::Unavailable("job map lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.jobs
            .write()
            .map_err(|_| StoreError::Unavailable("job map lock poisoned".to_string()))
    }

    /// Apply `f` to the job `id` under the write lock and return the result.
    fn update<F>(&self, id: JobId, f: F) -> Result<Job, StoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), StoreError>,
    {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        f(job)?;
        Ok(job.clone())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn oldest_first(a: &Job, b: &Job) -> std::cmp::Ordering {
    a.queued_at()
        .cmp(&b.queued_at())
        .then_with(|| a.id().cmp(&b.id()))
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, new: NewJob) -> Result<Job, StoreError> {
        let now = self.clock.now();
        new.check_delay(now)?;
        let delay = new.effective_delay();
        let job = Job::new(new.queue, new.data, delay, now)?;
        self.write()?.insert(job.id(), job.clone());
        Ok(job)
    }

    async fn claim_batch(&self, queue: &QueueName, max: usize) -> Result<Vec<Job>, StoreError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut jobs = self.write()?;

        let mut eligible: Vec<&mut Job> = jobs
            .values_mut()
            .filter(|j| j.queue() == queue && j.is_eligible(now))
            .collect();
        eligible.sort_by(|a, b| oldest_first(a, b));

        let mut claimed = Vec::with_capacity(max.min(eligible.len()));
        for job in eligible.into_iter().take(max) {
            job.claim(now)?;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn complete(&self, id: JobId) -> Result<Job, StoreError> {
        let now = self.clock.now();
        self.update(id, |job| Ok(job.complete(now)?))
    }

    async fn fail(
        &self,
        id: JobId,
        exception: JobException,
        decision: RetryDecision,
    ) -> Result<Job, StoreError> {
        let now = self.clock.now();
        self.update(id, |job| Ok(job.fail(now, exception, decision)?))
    }

    async fn heartbeat(&self, id: JobId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        Ok(job.heartbeat(now).is_ok())
    }

    async fn requeue_orphaned(&self, liveness_timeout: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut jobs = self.write()?;

        let mut recovered = 0;
        for job in jobs
            .values_mut()
            .filter(|j| j.is_orphaned(now, liveness_timeout))
        {
            job.requeue_orphan(liveness_timeout)?;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let jobs = self.read()?;
        let mut matching: Vec<&Job> = jobs.values().filter(|j| filter.matches(j)).collect();
        matching.sort_by(|a, b| oldest_first(a, b));
        Ok(matching.into_iter().take(filter.limit).cloned().collect())
    }

    async fn stats(&self, queue: &QueueName) -> Result<JobStats, StoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values().filter(|j| j.queue() == queue) {
            stats.add(job.status(), 1);
        }
        Ok(stats)
    }

    async fn stats_by_queue(&self) -> Result<BTreeMap<QueueName, JobStats>, StoreError> {
        let jobs = self.read()?;
        let mut by_queue: BTreeMap<QueueName, JobStats> = BTreeMap::new();
        for job in jobs.values() {
            by_queue
                .entry(job.queue().clone())
                .or_default()
                .add(job.status(), 1);
        }
        Ok(by_queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use chrono::{DateTime, Utc};
    use fediq_core::ManualClock;
    use fediq_jobs::{HandlerError, JobStatus, ORIGIN_RECOVERY, RetryPolicy};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn store() -> (Arc<InMemoryJobStore>, ManualClock) {
        let clock = ManualClock::new(t0());
        let store = Arc::new(InMemoryJobStore::with_clock(Arc::new(clock.clone())));
        (store, clock)
    }

    fn q(name: &str) -> QueueName {
        QueueName::new(name).unwrap()
    }

    #[tokio::test]
    async fn enqueue_then_claim_runs_job() {
        let (store, _) = store();
        let a = store
            .enqueue(NewJob::new(q("mail"), b"hello".to_vec()))
            .await
            .unwrap();
        assert_eq!(a.status(), JobStatus::Queued);

        let claimed = store.claim_batch(&q("mail"), 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id(), a.id());
        assert_eq!(claimed[0].status(), JobStatus::Running);
        assert_eq!(claimed[0].started_at(), Some(t0()));
        assert_eq!(claimed[0].data(), b"hello");
    }

    #[tokio::test]
    async fn retry_then_success() {
        let (store, clock) = store();
        let policy = RetryPolicy::default();
        let a = store.enqueue(NewJob::new(q("mail"), vec![])).await.unwrap();
        store.claim_batch(&q("mail"), 1).await.unwrap();

        let err = HandlerError::retryable("smtp unavailable");
        let decision = policy.decide(0, &err);
        let failed = store.fail(a.id(), err.to_exception(), decision).await.unwrap();
        assert_eq!(failed.status(), JobStatus::Delayed);
        assert_eq!(failed.retry_count(), 1);
        assert_eq!(
            failed.delayed_until(),
            Some(t0() + chrono::Duration::seconds(1))
        );

        assert!(store.claim_batch(&q("mail"), 1).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(1));
        let again = store.claim_batch(&q("mail"), 1).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id(), a.id());
        assert_eq!(again[0].started_at(), Some(t0()));

        let done = store.complete(a.id()).await.unwrap();
        assert_eq!(done.status(), JobStatus::Completed);
        assert_eq!(
            done.finished_at(),
            Some(t0() + chrono::Duration::seconds(1))
        );
        assert_eq!(done.exception().unwrap().message, "smtp unavailable");
    }

    #[tokio::test]
    async fn delayed_enqueue_waits() {
        let (store, clock) = store();
        let job = store
            .enqueue(NewJob::new(q("cleanup"), vec![]).delayed(Duration::from_secs(300)))
            .await
            .unwrap();
        assert_eq!(job.status(), JobStatus::Delayed);

        clock.advance(Duration::from_secs(299));
        assert!(store.claim_batch(&q("cleanup"), 10).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.claim_batch(&q("cleanup"), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn out_of_range_delay_is_rejected() {
        let (store, _) = store();
        let huge = NewJob::new(q("cleanup"), vec![]).delayed(Duration::from_millis(i64::MAX as u64));
        assert!(matches!(
            store.enqueue(huge).await,
            Err(StoreError::Validation(_))
        ));
        assert_eq!(store.stats(&q("cleanup")).await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn claim_is_oldest_first_and_bounded() {
        let (store, clock) = store();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.enqueue(NewJob::new(q("deliver"), vec![])).await.unwrap().id());
            clock.advance(Duration::from_millis(10));
        }

        let first = store.claim_batch(&q("deliver"), 2).await.unwrap();
        let first_ids: Vec<_> = first.iter().map(|j| j.id()).collect();
        assert_eq!(first_ids, ids[..2]);

        let rest = store.claim_batch(&q("deliver"), 10).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert!(store.claim_batch(&q("deliver"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_respects_queue_and_zero_max() {
        let (store, _) = store();
        store.enqueue(NewJob::new(q("inbox"), vec![])).await.unwrap();

        assert!(store.claim_batch(&q("inbox"), 0).await.unwrap().is_empty());
        assert!(store.claim_batch(&q("outbox"), 5).await.unwrap().is_empty());
        assert_eq!(store.claim_batch(&q("inbox"), 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_claimers_never_share_a_job() {
        let store = InMemoryJobStore::arc();
        for i in 0..1000u32 {
            store
                .enqueue(NewJob::new(q("fanout"), i.to_be_bytes().to_vec()))
                .await
                .unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_batch(&q("fanout"), 50).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|j| j.id()));
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for task in tasks {
            for id in task.await.unwrap() {
                total += 1;
                seen.insert(id);
            }
        }
        assert_eq!(total, 1000);
        assert_eq!(seen.len(), 1000);

        let stats = store.stats(&q("fanout")).await.unwrap();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.running, 1000);
    }

    #[tokio::test]
    async fn stale_running_job_is_recovered() {
        let (store, clock) = store();
        let liveness = Duration::from_secs(60);
        let a = store.enqueue(NewJob::new(q("mail"), vec![])).await.unwrap();
        store.claim_batch(&q("mail"), 1).await.unwrap();

        clock.advance(Duration::from_secs(60));
        assert_eq!(store.requeue_orphaned(liveness).await.unwrap(), 0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.requeue_orphaned(liveness).await.unwrap(), 1);

        let job = store.get(a.id()).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Queued);
        assert_eq!(job.retry_count(), 1);
        assert!(job.heartbeat_at().is_none());
        assert_eq!(
            job.exception().unwrap().source.as_deref(),
            Some(ORIGIN_RECOVERY)
        );
    }

    #[tokio::test]
    async fn heartbeat_keeps_job_alive() {
        let (store, clock) = store();
        let liveness = Duration::from_secs(60);
        let a = store.enqueue(NewJob::new(q("mail"), vec![])).await.unwrap();
        store.claim_batch(&q("mail"), 1).await.unwrap();

        for _ in 0..5 {
            clock.advance(Duration::from_secs(30));
            assert!(store.heartbeat(a.id()).await.unwrap());
            assert_eq!(store.requeue_orphaned(liveness).await.unwrap(), 0);
        }

        store.complete(a.id()).await.unwrap();
        assert!(!store.heartbeat(a.id()).await.unwrap());
    }

    #[tokio::test]
    async fn finishing_requires_running() {
        let (store, _) = store();
        let a = store.enqueue(NewJob::new(q("mail"), vec![])).await.unwrap();

        assert!(matches!(
            store.complete(a.id()).await,
            Err(StoreError::InvalidTransition { operation: "complete", .. })
        ));
        assert!(matches!(
            store.complete(JobId::new()).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.heartbeat(JobId::new()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn permanent_failure_is_terminal() {
        let (store, _) = store();
        let a = store.enqueue(NewJob::new(q("mail"), vec![])).await.unwrap();
        store.claim_batch(&q("mail"), 1).await.unwrap();

        let err = HandlerError::permanent("recipient gone");
        let decision = RetryPolicy::default().decide(0, &err);
        let job = store.fail(a.id(), err.to_exception(), decision).await.unwrap();

        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.finished_at(), Some(t0()));
        assert!(store.claim_batch(&q("mail"), 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_and_stats_filter_by_queue_and_status() {
        let (store, clock) = store();
        for name in ["mail", "mail", "inbox"] {
            store.enqueue(NewJob::new(q(name), vec![])).await.unwrap();
            clock.advance(Duration::from_millis(1));
        }
        store.claim_batch(&q("mail"), 1).await.unwrap();

        let running = store
            .list(&JobFilter::default().status(JobStatus::Running))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);

        let mail = store.list(&JobFilter::default().queue(q("mail"))).await.unwrap();
        assert_eq!(mail.len(), 2);
        assert!(mail[0].queued_at() <= mail[1].queued_at());

        let limited = store.list(&JobFilter::default().limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);

        let by_queue = store.stats_by_queue().await.unwrap();
        assert_eq!(by_queue[&q("mail")].running, 1);
        assert_eq!(by_queue[&q("mail")].queued, 1);
        assert_eq!(by_queue[&q("inbox")].queued, 1);
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig {
            cases: 64,
            ..proptest::prelude::ProptestConfig::default()
        })]

        /// Any sequence of batch sizes hands out each job at most once and
        /// eventually drains the queue.
        #[test]
        fn claim_batches_are_disjoint_and_drain(
            backlog in 0usize..60,
            batches in proptest::collection::vec(0usize..8, 1..40),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let (store, _) = store();
                let queue = q("inbox");
                let mut enqueued = HashSet::new();
                for i in 0..backlog {
                    let job = store
                        .enqueue(NewJob::new(queue.clone(), vec![i as u8]))
                        .await
                        .unwrap();
                    enqueued.insert(job.id());
                }

                let mut seen = HashSet::new();
                for max in batches.iter().copied().cycle().take(backlog + batches.len()) {
                    let claimed = store.claim_batch(&queue, max).await.unwrap();
                    proptest::prop_assert!(claimed.len() <= max);
                    for job in claimed {
                        proptest::prop_assert_eq!(job.status(), JobStatus::Running);
                        proptest::prop_assert!(seen.insert(job.id()), "job claimed twice");
                    }
                }
                // Batch sizes of zero can stall the cycle, so finish with
                // single claims before checking the backlog is gone.
                while seen.len() < backlog {
                    let claimed = store.claim_batch(&queue, 1).await.unwrap();
                    proptest::prop_assert_eq!(claimed.len(), 1);
                    proptest::prop_assert!(seen.insert(claimed[0].id()), "job claimed twice");
                }

                proptest::prop_assert_eq!(&seen, &enqueued);
                proptest::prop_assert!(store.claim_batch(&queue, 8).await.unwrap().is_empty());
                let stats = store.stats(&queue).await.unwrap();
                proptest::prop_assert_eq!(stats.running, backlog as u64);
                proptest::prop_assert_eq!(stats.queued, 0);
                Ok::<(), proptest::test_runner::TestCaseError>(())
            })?;
        }
    }
}
