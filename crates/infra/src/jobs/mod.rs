//! Durable background job queue.
//!
//! ## Components
//!
//! - `JobStore`: persistence and the atomic claim (`InMemoryJobStore`, `PostgresJobStore`)
//! - `JobQueue`: enqueue and status inspection for producers
//! - `HandlerRegistry` / `JobHandler`: one handler per queue
//! - `Dispatcher`: per-queue claim loop feeding a bounded worker pool
//! - `WorkerHarness`: runs one job with heartbeat and timeout, records the outcome
//! - `RecoverySweeper`: requeues running jobs whose heartbeat went stale
//! - `JobRuntime`: assembles the above and owns their lifecycle
//!
//! Execution is at-least-once; handlers must be idempotent.

pub mod dispatcher;
pub mod harness;
pub mod in_memory;
pub mod postgres;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod store;
pub mod sweeper;

pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats};
pub use harness::{FailureCause, JobOutcome, WorkerHarness};
pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use queue::JobQueue;
pub use registry::{
    HandlerRegistry, JobContext, JobHandler, JsonHandler, QueueOptions, Registration,
    RegistryError,
};
pub use runtime::{JobRuntime, JobRuntimeHandle, RuntimeConfig};
pub use store::{JobFilter, JobStats, JobStore, NewJob, StoreError};
pub use sweeper::{RecoverySweeper, SweeperConfig};
