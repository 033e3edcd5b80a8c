//! `fediq-worker` — maintenance daemon for a shared job store.
//!
//! Runs the recovery sweeper and periodically logs per-queue job counts.
//! Application processes run their own dispatchers (via `JobRuntime`) and can
//! leave sweeping to this process with `RuntimeConfig::without_sweeper`.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use fediq_infra::{ConfigError, JobsConfig};
use fediq_infra::jobs::{JobStore, RecoverySweeper};

/// Run until `shutdown` resolves, then stop the sweeper and return.
///
/// Fails before spawning anything if `config` does not validate.
pub async fn run<S>(
    store: Arc<dyn JobStore>,
    config: &JobsConfig,
    shutdown: S,
) -> Result<(), ConfigError>
where
    S: Future<Output = ()>,
{
    config.validate()?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = RecoverySweeper::new(Arc::clone(&store), config.sweeper_config());
    let sweeper_task = tokio::spawn(sweeper.run(stop_rx.clone()));
    let stats_task = tokio::spawn(log_stats(store, config.stats_interval, stop_rx));

    info!("fediq-worker running");
    shutdown.await;
    info!("shutdown requested");

    let _ = stop_tx.send(true);
    for (name, task) in [("sweeper", sweeper_task), ("stats", stats_task)] {
        if let Err(err) = task.await {
            error!(task = name, error = %err, "task failed");
        }
    }
    info!("fediq-worker stopped");
    Ok(())
}

async fn log_stats(
    store: Arc<dyn JobStore>,
    interval: std::time::Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match store.stats_by_queue().await {
                    Ok(by_queue) => {
                        for (queue, stats) in by_queue {
                            info!(
                                %queue,
                                queued = stats.queued,
                                delayed = stats.delayed,
                                running = stats.running,
                                completed = stats.completed,
                                failed = stats.failed,
                                "queue stats"
                            );
                        }
                    }
                    Err(err) => error!(error = %err, "failed to read queue stats"),
                }
            }
        }
    }
}
