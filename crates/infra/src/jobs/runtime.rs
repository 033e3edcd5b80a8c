//! Runtime lifecycle: wires registered handlers to dispatchers and runs the
//! recovery sweeper.
//!
//! ```ignore
//! let mut runtime = JobRuntime::new(store, RuntimeConfig::default());
//! runtime.register("deliver", deliver_handler)?;
//! let handle = runtime.start()?;
//! handle.queue().enqueue("deliver", payload, None).await?;
//! handle.stop().await;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tracing::{error, info};

use fediq_core::QueueName;

use crate::config::ConfigError;

use super::dispatcher::{Dispatcher, DispatcherConfig, DispatcherCounters, DispatcherStats};
use super::queue::JobQueue;
use super::registry::{HandlerRegistry, JobHandler, QueueOptions, RegistryError};
use super::store::JobStore;
use super::sweeper::{RecoverySweeper, SweeperConfig};

/// Runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub dispatcher: DispatcherConfig,
    pub sweeper: SweeperConfig,
    /// Run the recovery sweeper in this runtime. Turn off when another process
    /// (e.g. `fediq-worker`) sweeps the shared store.
    pub run_sweeper: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            sweeper: SweeperConfig::default(),
            run_sweeper: true,
        }
    }
}

impl RuntimeConfig {
    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_sweeper(mut self, sweeper: SweeperConfig) -> Self {
        self.sweeper = sweeper;
        self
    }

    pub fn without_sweeper(mut self) -> Self {
        self.run_sweeper = false;
        self
    }

    /// Check the dispatcher and sweeper settings together.
    ///
    /// The liveness timeout must exceed the heartbeat interval even when this
    /// runtime does not sweep, since another process sweeping the same store
    /// is expected to use the same values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dispatcher.validate()?;
        self.sweeper.validate()?;
        if self.sweeper.liveness_timeout <= self.dispatcher.heartbeat_interval {
            return Err(ConfigError::Invalid {
                name: "sweeper.liveness_timeout",
                value: format!("{:?}", self.sweeper.liveness_timeout),
                reason: format!(
                    "must exceed the heartbeat interval ({:?})",
                    self.dispatcher.heartbeat_interval
                ),
            });
        }
        Ok(())
    }
}

/// A job runtime being assembled: store, handlers and settings.
///
/// Nothing runs until [`JobRuntime::start`].
pub struct JobRuntime {
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
    config: RuntimeConfig,
}

impl JobRuntime {
    pub fn new(store: Arc<dyn JobStore>, config: RuntimeConfig) -> Self {
        Self {
            store,
            registry: HandlerRegistry::new(),
            config,
        }
    }

    /// Register `handler` for `queue` with default [`QueueOptions`].
    pub fn register<H: JobHandler>(
        &mut self,
        queue: impl AsRef<str>,
        handler: H,
    ) -> Result<&mut Self, RegistryError> {
        self.register_with(queue, handler, QueueOptions::default())
    }

    pub fn register_with<H: JobHandler>(
        &mut self,
        queue: impl AsRef<str>,
        handler: H,
        options: QueueOptions,
    ) -> Result<&mut Self, RegistryError> {
        self.registry.register(queue, handler, options)?;
        Ok(self)
    }

    pub fn queues(&self) -> impl Iterator<Item = &QueueName> {
        self.registry.queues()
    }

    /// Spawn one dispatcher per registered queue, plus the sweeper if enabled.
    ///
    /// Fails without spawning anything if the configuration is invalid. Must be
    /// called from within a tokio runtime.
    pub fn start(self) -> Result<JobRuntimeHandle, ConfigError> {
        self.config.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let mut wakers = HashMap::new();
        let mut counters = BTreeMap::new();

        for registration in self.registry.into_registrations() {
            let wake = Arc::new(Notify::new());
            let queue = registration.queue.clone();
            let dispatcher = Dispatcher::new(
                Arc::clone(&self.store),
                registration,
                self.config.dispatcher.clone(),
                Arc::clone(&wake),
            );
            counters.insert(queue.clone(), dispatcher.counters());
            wakers.insert(queue, wake);
            tasks.spawn(dispatcher.run(shutdown_rx.clone()));
        }

        if self.config.run_sweeper {
            let sweeper = RecoverySweeper::new(Arc::clone(&self.store), self.config.sweeper.clone());
            tasks.spawn(sweeper.run(shutdown_rx.clone()));
        }

        info!(
            queues = counters.len(),
            sweeper = self.config.run_sweeper,
            "job runtime started"
        );

        Ok(JobRuntimeHandle {
            queue: JobQueue::with_wakers(self.store, wakers),
            shutdown: shutdown_tx,
            tasks,
            counters,
        })
    }
}

/// A running job runtime.
pub struct JobRuntimeHandle {
    queue: JobQueue,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
    counters: BTreeMap<QueueName, Arc<DispatcherCounters>>,
}

impl JobRuntimeHandle {
    /// Enqueue API bound to this runtime's store and dispatchers.
    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    pub fn dispatcher_stats(&self, queue: &QueueName) -> Option<DispatcherStats> {
        self.counters.get(queue).map(|c| c.snapshot())
    }

    pub fn all_dispatcher_stats(&self) -> BTreeMap<QueueName, DispatcherStats> {
        self.counters
            .iter()
            .map(|(q, c)| (q.clone(), c.snapshot()))
            .collect()
    }

    /// Stop claiming, let in-flight jobs finish within the shutdown grace
    /// period, then return. Jobs aborted at the deadline stay `Running` and
    /// are recovered by the sweeper.
    pub async fn stop(mut self) {
        info!("stopping job runtime");
        let _ = self.shutdown.send(true);
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "job runtime task failed");
            }
        }
        info!("job runtime stopped");
    }
}
