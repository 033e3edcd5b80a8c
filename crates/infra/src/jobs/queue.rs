//! Producer-facing enqueue and inspection API.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;

use fediq_core::{JobId, QueueName};
use fediq_jobs::Job;

use super::store::{JobFilter, JobStats, JobStore, NewJob, StoreError};

/// Handle for enqueuing and inspecting jobs.
///
/// Cheap to clone. A queue obtained from a running
/// [`super::runtime::JobRuntimeHandle`] also wakes the local dispatcher of the
/// target queue, so new work starts without waiting for the next poll.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    wakers: Arc<HashMap<QueueName, Arc<Notify>>>,
}

impl JobQueue {
    /// A queue with no local dispatchers to wake (producer-only processes).
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_wakers(store, HashMap::new())
    }

    pub(crate) fn with_wakers(
        store: Arc<dyn JobStore>,
        wakers: HashMap<QueueName, Arc<Notify>>,
    ) -> Self {
        Self {
            store,
            wakers: Arc::new(wakers),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Persist a job and return its id.
    ///
    /// The job is `Queued`, or `Delayed` when `delay` is non-zero. The payload
    /// is stored as-is and never interpreted.
    pub async fn enqueue(
        &self,
        queue: impl AsRef<str>,
        data: Vec<u8>,
        delay: Option<Duration>,
    ) -> Result<JobId, StoreError> {
        let queue = QueueName::new(queue.as_ref())?;
        let new = NewJob {
            queue,
            data,
            delay,
        };
        let immediate = new.effective_delay().is_none();
        let job = self.store.enqueue(new).await?;

        debug!(queue = %job.queue(), job_id = %job.id(), status = %job.status(), "job enqueued");

        if immediate {
            if let Some(wake) = self.wakers.get(job.queue()) {
                wake.notify_one();
            }
        }
        Ok(job.id())
    }

    /// Serialize `payload` as JSON and enqueue it.
    pub async fn enqueue_json<T>(
        &self,
        queue: impl AsRef<str>,
        payload: &T,
        delay: Option<Duration>,
    ) -> Result<JobId, StoreError>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_vec(payload)?;
        self.enqueue(queue, data, delay).await
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        self.store.list(filter).await
    }

    pub async fn stats(&self, queue: impl AsRef<str>) -> Result<JobStats, StoreError> {
        let queue = QueueName::new(queue.as_ref())?;
        self.store.stats(&queue).await
    }

    pub async fn stats_by_queue(&self) -> Result<BTreeMap<QueueName, JobStats>, StoreError> {
        self.store.stats_by_queue().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fediq_jobs::JobStatus;

    use crate::jobs::in_memory::InMemoryJobStore;

    #[derive(Serialize)]
    struct Activity<'a> {
        kind: &'a str,
        object: &'a str,
    }

    #[tokio::test]
    async fn enqueue_returns_persisted_id() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let id = queue.enqueue("deliver", b"raw".to_vec(), None).await.unwrap();

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Queued);
        assert_eq!(job.data(), b"raw");
    }

    #[tokio::test]
    async fn delay_produces_delayed_job() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let id = queue
            .enqueue("cleanup", vec![], Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(
            queue.get(id).await.unwrap().unwrap().status(),
            JobStatus::Delayed
        );
    }

    #[tokio::test]
    async fn json_payloads_are_serialized() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let id = queue
            .enqueue_json(
                "inbox",
                &Activity {
                    kind: "Follow",
                    object: "https://example.social/users/alice",
                },
                None,
            )
            .await
            .unwrap();

        let job = queue.get(id).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(job.data()).unwrap();
        assert_eq!(value["kind"], "Follow");
    }

    #[tokio::test]
    async fn invalid_queue_name_is_rejected() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let err = queue.enqueue("has space", vec![], None).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn enqueue_wakes_local_dispatcher() {
        let wake = Arc::new(Notify::new());
        let mut wakers = HashMap::new();
        wakers.insert(QueueName::new("deliver").unwrap(), Arc::clone(&wake));
        let queue = JobQueue::with_wakers(InMemoryJobStore::arc(), wakers);

        queue.enqueue("deliver", vec![], None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), wake.notified())
            .await
            .unwrap();
    }
}
