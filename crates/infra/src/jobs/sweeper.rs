//! Recovery sweeper: requeues jobs whose worker stopped heartbeating.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, require_nonzero};

use super::store::{JobStore, StoreError};

/// Sweeper settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweeperConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// A running job whose heartbeat is older than this is considered orphaned.
    pub liveness_timeout: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(60),
        }
    }
}

impl SweeperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_liveness_timeout(mut self, liveness_timeout: Duration) -> Self {
        self.liveness_timeout = liveness_timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero("sweeper.interval", self.interval)?;
        require_nonzero("sweeper.liveness_timeout", self.liveness_timeout)
    }
}

#[derive(Clone)]
pub struct RecoverySweeper {
    store: Arc<dyn JobStore>,
    config: SweeperConfig,
}

impl RecoverySweeper {
    pub fn new(store: Arc<dyn JobStore>, config: SweeperConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// One pass. Returns the number of jobs put back into `Queued`.
    pub async fn sweep_once(&self) -> Result<u64, StoreError> {
        let recovered = self
            .store
            .requeue_orphaned(self.config.liveness_timeout)
            .await?;
        if recovered > 0 {
            warn!(
                recovered,
                liveness_timeout_secs = self.config.liveness_timeout.as_secs(),
                "requeued orphaned jobs"
            );
        } else {
            debug!("no orphaned jobs");
        }
        Ok(recovered)
    }

    /// Sweep immediately, then every `interval`, until `shutdown` turns `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Err(err) = self.config.validate() {
            error!(error = %err, "recovery sweeper not started");
            return;
        }
        info!(
            interval_secs = self.config.interval.as_secs(),
            liveness_timeout_secs = self.config.liveness_timeout.as_secs(),
            "recovery sweeper started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        error!(error = %err, "recovery sweep failed");
                    }
                }
            }
        }

        info!("recovery sweeper stopped");
    }
}
