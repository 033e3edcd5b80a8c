//! End-to-end runtime behaviour against the in-memory store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fediq_core::{JobId, ManualClock, QueueName};
use fediq_infra::ConfigError;
use fediq_infra::jobs::{
    DispatcherConfig, InMemoryJobStore, JobContext, JobFilter, JobQueue, JobRuntime, JobStore,
    JsonHandler, NewJob, QueueOptions, RecoverySweeper, RegistryError, RuntimeConfig,
    SweeperConfig,
};
use fediq_jobs::{HandlerError, JobStatus, RetryPolicy};
use serde::{Deserialize, Serialize};

fn fast_config() -> RuntimeConfig {
    RuntimeConfig::default()
        .with_dispatcher(
            DispatcherConfig::default()
                .with_poll_interval(Duration::from_millis(20))
                .with_heartbeat_interval(Duration::from_millis(50))
                .with_error_backoff(Duration::from_millis(20))
                .with_shutdown_grace(Duration::from_secs(5)),
        )
        .without_sweeper()
}

fn q(name: &str) -> QueueName {
    QueueName::new(name).unwrap()
}

/// Poll `check` until it returns true or five seconds pass.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn completed(queue: &JobQueue, name: &str) -> u64 {
    queue.stats(name).await.unwrap().completed
}

#[tokio::test]
async fn enqueued_jobs_run_to_completion() {
    let store = InMemoryJobStore::arc();
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();

    let mut runtime = JobRuntime::new(store.clone(), fast_config());
    runtime
        .register("deliver", move |_ctx: JobContext, _data: Vec<u8>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();
    let handle = runtime.start().unwrap();
    let queue = handle.queue();

    for i in 0..20u8 {
        queue.enqueue("deliver", vec![i], None).await.unwrap();
    }

    eventually(|| async { completed(&queue, "deliver").await == 20 }).await;
    assert_eq!(runs.load(Ordering::SeqCst), 20);

    let stats = handle.dispatcher_stats(&q("deliver")).unwrap();
    assert_eq!(stats.claimed, 20);
    assert_eq!(stats.succeeded, 20);
    assert_eq!(stats.running, 0);

    handle.stop().await;
}

#[tokio::test]
async fn retryable_failure_is_retried_then_succeeds() {
    let store = InMemoryJobStore::arc();
    let mut runtime = JobRuntime::new(store.clone(), fast_config());
    runtime
        .register_with(
            "mail",
            |ctx: JobContext, _data: Vec<u8>| async move {
                if ctx.attempt == 1 {
                    Err(HandlerError::retryable("smtp 451").with_origin("smtp"))
                } else {
                    Ok(())
                }
            },
            QueueOptions::default().with_retry(RetryPolicy::fixed(3, Duration::from_millis(50))),
        )
        .unwrap();
    let handle = runtime.start().unwrap();
    let queue = handle.queue();

    let id = queue.enqueue("mail", b"hi".to_vec(), None).await.unwrap();
    eventually(|| async { completed(&queue, "mail").await == 1 }).await;

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status(), JobStatus::Completed);
    assert_eq!(job.retry_count(), 1);
    assert_eq!(job.exception().unwrap().source.as_deref(), Some("smtp"));

    let stats = handle.dispatcher_stats(&q("mail")).unwrap();
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.succeeded, 1);

    handle.stop().await;
}

#[tokio::test]
async fn exhausted_retries_fail_the_job() {
    let store = InMemoryJobStore::arc();
    let mut runtime = JobRuntime::new(store.clone(), fast_config());
    runtime
        .register_with(
            "deliver",
            |_ctx: JobContext, _data: Vec<u8>| async {
                Err::<(), _>(HandlerError::retryable("connection refused"))
            },
            QueueOptions::default().with_retry(RetryPolicy::fixed(2, Duration::from_millis(10))),
        )
        .unwrap();
    let handle = runtime.start().unwrap();
    let queue = handle.queue();

    let id = queue.enqueue("deliver", vec![], None).await.unwrap();
    eventually(|| async { queue.stats("deliver").await.unwrap().failed == 1 }).await;

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.retry_count(), 2);
    assert!(job.finished_at().is_some());
    assert_eq!(job.exception().unwrap().message, "connection refused");

    handle.stop().await;
}

#[tokio::test]
async fn worker_pool_respects_concurrency() {
    let store = InMemoryJobStore::arc();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (active.clone(), peak.clone());

    let mut runtime = JobRuntime::new(store.clone(), fast_config());
    runtime
        .register_with(
            "fanout",
            move |_ctx: JobContext, _data: Vec<u8>| {
                let (active, peak) = (a.clone(), p.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            },
            QueueOptions::default().with_concurrency(2).with_max_batch(10),
        )
        .unwrap();
    let handle = runtime.start().unwrap();
    let queue = handle.queue();

    for _ in 0..10 {
        queue.enqueue("fanout", vec![], None).await.unwrap();
    }
    eventually(|| async { completed(&queue, "fanout").await == 10 }).await;

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
    handle.stop().await;
}

#[tokio::test]
async fn two_runtimes_on_one_store_never_run_a_job_twice() {
    let store = InMemoryJobStore::arc();
    let seen: Arc<Mutex<Vec<JobId>>> = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let seen = seen.clone();
        let mut runtime = JobRuntime::new(store.clone(), fast_config());
        runtime
            .register_with(
                "fanout",
                move |ctx: JobContext, _data: Vec<u8>| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(ctx.id);
                        Ok::<(), HandlerError>(())
                    }
                },
                QueueOptions::default().with_concurrency(4).with_max_batch(50),
            )
            .unwrap();
        handles.push(runtime.start().unwrap());
    }

    let producer = JobQueue::new(store.clone());
    for _ in 0..200 {
        producer.enqueue("fanout", vec![], None).await.unwrap();
    }
    eventually(|| async { completed(&producer, "fanout").await == 200 }).await;

    let seen = seen.lock().unwrap().clone();
    let distinct: HashSet<_> = seen.iter().collect();
    assert_eq!(seen.len(), 200);
    assert_eq!(distinct.len(), 200);

    for handle in handles {
        handle.stop().await;
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Follow {
    actor: String,
    object: String,
}

#[tokio::test]
async fn json_handler_round_trips_typed_payloads() {
    let store = InMemoryJobStore::arc();
    let actors = Arc::new(Mutex::new(Vec::new()));
    let sink = actors.clone();

    let mut runtime = JobRuntime::new(store.clone(), fast_config());
    runtime
        .register(
            "inbox",
            JsonHandler::<Follow, _>::new(move |_ctx: JobContext, follow: Follow| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(follow.actor);
                    Ok::<(), HandlerError>(())
                }
            }),
        )
        .unwrap();
    let handle = runtime.start().unwrap();
    let queue = handle.queue();

    let follow = Follow {
        actor: "https://a.example/users/ann".into(),
        object: "https://b.example/users/bob".into(),
    };
    queue.enqueue_json("inbox", &follow, None).await.unwrap();
    let bad = queue.enqueue("inbox", b"{".to_vec(), None).await.unwrap();

    eventually(|| async {
        let stats = queue.stats("inbox").await.unwrap();
        stats.completed == 1 && stats.failed == 1
    })
    .await;

    assert_eq!(*actors.lock().unwrap(), vec![follow.actor.clone()]);
    let bad = queue.get(bad).await.unwrap().unwrap();
    assert_eq!(bad.status(), JobStatus::Failed);
    assert_eq!(bad.retry_count(), 0);

    handle.stop().await;
}

#[tokio::test]
async fn duplicate_queue_registration_is_an_error() {
    let mut runtime = JobRuntime::new(InMemoryJobStore::arc(), fast_config());
    let handler = |_ctx: JobContext, _data: Vec<u8>| async { Ok::<(), HandlerError>(()) };
    runtime.register("deliver", handler).unwrap();
    assert!(matches!(
        runtime.register("deliver", handler),
        Err(RegistryError::DuplicateQueue(_))
    ));
}

#[tokio::test]
async fn stop_waits_for_in_flight_jobs() {
    let store = InMemoryJobStore::arc();
    let mut runtime = JobRuntime::new(store.clone(), fast_config());
    runtime
        .register("slow", |_ctx: JobContext, _data: Vec<u8>| async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok::<(), HandlerError>(())
        })
        .unwrap();
    let handle = runtime.start().unwrap();
    let queue = handle.queue();

    let id = queue.enqueue("slow", vec![], None).await.unwrap();
    eventually(|| async {
        queue.get(id).await.unwrap().unwrap().status() == JobStatus::Running
    })
    .await;

    handle.stop().await;
    assert_eq!(
        store.get(id).await.unwrap().unwrap().status(),
        JobStatus::Completed
    );
}

#[tokio::test]
async fn aborted_jobs_are_recovered_by_the_sweeper() {
    let clock = ManualClock::starting_now();
    let store = Arc::new(InMemoryJobStore::with_clock(Arc::new(clock.clone())));
    let config = fast_config().with_dispatcher(
        DispatcherConfig::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_heartbeat_interval(Duration::from_secs(3600))
            .with_shutdown_grace(Duration::from_millis(50)),
    )
    .with_sweeper(SweeperConfig::default().with_liveness_timeout(Duration::from_secs(7200)));

    let mut runtime = JobRuntime::new(store.clone(), config);
    runtime
        .register("stuck", |_ctx: JobContext, _data: Vec<u8>| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<(), HandlerError>(())
        })
        .unwrap();
    let handle = runtime.start().unwrap();
    let queue = handle.queue();

    let id = queue.enqueue("stuck", vec![], None).await.unwrap();
    eventually(|| async {
        queue.get(id).await.unwrap().unwrap().status() == JobStatus::Running
    })
    .await;
    handle.stop().await;

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status(), JobStatus::Running);

    clock.advance(Duration::from_secs(120));
    let sweeper = RecoverySweeper::new(
        store.clone(),
        SweeperConfig::default().with_liveness_timeout(Duration::from_secs(60)),
    );
    assert_eq!(sweeper.sweep_once().await.unwrap(), 1);

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status(), JobStatus::Queued);
    assert_eq!(job.retry_count(), 1);

    let queued = store
        .list(&JobFilter::default().status(JobStatus::Queued))
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
}

#[tokio::test]
async fn runtime_sweeper_recovers_on_start() {
    let clock = ManualClock::starting_now();
    let store = Arc::new(InMemoryJobStore::with_clock(Arc::new(clock.clone())));

    // A job claimed by a process that then died.
    let crashed = store
        .enqueue(NewJob::new(q("deliver"), vec![]))
        .await
        .unwrap();
    store.claim_batch(&q("deliver"), 1).await.unwrap();
    clock.advance(Duration::from_secs(300));

    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    let config = RuntimeConfig::default()
        .with_dispatcher(DispatcherConfig::default().with_poll_interval(Duration::from_millis(20)))
        .with_sweeper(
            SweeperConfig::default()
                .with_interval(Duration::from_secs(3600))
                .with_liveness_timeout(Duration::from_secs(60)),
        );
    let mut runtime = JobRuntime::new(store.clone(), config);
    runtime
        .register("deliver", move |_ctx: JobContext, _data: Vec<u8>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();
    let handle = runtime.start().unwrap();

    eventually(|| async {
        store.get(crashed.id()).await.unwrap().unwrap().status() == JobStatus::Completed
    })
    .await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(store.get(crashed.id()).await.unwrap().unwrap().retry_count(), 1);

    handle.stop().await;
}

#[tokio::test]
async fn binary_payload_reaches_handler_unchanged() {
    let store = InMemoryJobStore::arc();
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();

    let mut runtime = JobRuntime::new(store.clone(), fast_config());
    runtime
        .register("media", move |_ctx: JobContext, data: Vec<u8>| {
            let sink = sink.clone();
            async move {
                *sink.lock().unwrap() = Some(data);
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();
    let handle = runtime.start().unwrap();
    let queue = handle.queue();

    let payload = vec![0xff, 0xfe, 0x00, 0x80, 0x00, b'\n'];
    queue.enqueue("media", payload.clone(), None).await.unwrap();
    eventually(|| async { completed(&queue, "media").await == 1 }).await;

    assert_eq!(seen.lock().unwrap().as_deref(), Some(payload.as_slice()));
    handle.stop().await;
}

#[tokio::test]
async fn zero_heartbeat_interval_is_refused_at_start() {
    let config = RuntimeConfig::default()
        .with_dispatcher(DispatcherConfig::default().with_heartbeat_interval(Duration::ZERO));
    let mut runtime = JobRuntime::new(InMemoryJobStore::arc(), config);
    runtime
        .register("deliver", |_ctx: JobContext, _data: Vec<u8>| async {
            Ok::<(), HandlerError>(())
        })
        .unwrap();

    let err = runtime.start().err().unwrap();
    assert!(matches!(
        err,
        ConfigError::Invalid { name: "dispatcher.heartbeat_interval", .. }
    ));
}
