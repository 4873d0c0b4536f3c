//! Periodic store maintenance.
//!
//! Every background loop here follows the same shape: wait out an optional
//! initial delay, then call `tick` on a fixed interval until cancelled. The
//! [`ReactiveSubscription`] trait captures that shape, and [`MaintenanceLoop`]
//! owns the spawned tasks so shutdown can wait for them.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::MaintenanceConfig;
use crate::db::repos::sync as sync_repo;
use crate::db::{self, DbPool};

/// A periodic job driven by [`spawn_subscriptions`].
#[async_trait::async_trait]
pub trait ReactiveSubscription: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// Delay before the first tick.
    fn initial_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// One cycle. Errors are logged inside; the loop keeps going.
    async fn tick(&self);
}

/// Recompute thread summaries and drop orphaned messages.
pub struct RepairSubscription {
    pub pool: DbPool,
    pub interval: Duration,
    pub initial_delay: Duration,
}

/// Fold the WAL back into the main database file.
pub struct CheckpointSubscription {
    pub pool: DbPool,
    pub interval: Duration,
    pub initial_delay: Duration,
}

#[async_trait::async_trait]
impl ReactiveSubscription for RepairSubscription {
    fn name(&self) -> &'static str {
        "consistency_repair"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    async fn tick(&self) {
        let pool = self.pool.clone();
        match tokio::task::spawn_blocking(move || sync_repo::repair_consistency(&pool)).await {
            Ok(Ok(report)) => tracing::debug!(?report, "Scheduled repair complete"),
            Ok(Err(e)) => tracing::error!("Scheduled repair failed: {}", e),
            Err(e) => tracing::error!("Scheduled repair task failed: {}", e),
        }
    }
}

#[async_trait::async_trait]
impl ReactiveSubscription for CheckpointSubscription {
    fn name(&self) -> &'static str {
        "wal_checkpoint"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    async fn tick(&self) {
        let pool = self.pool.clone();
        match tokio::task::spawn_blocking(move || db::checkpoint(&pool)).await {
            Ok(Ok(result)) => tracing::debug!(?result, "WAL checkpoint complete"),
            Ok(Err(e)) => tracing::warn!("WAL checkpoint failed: {}", e),
            Err(e) => tracing::error!("WAL checkpoint task failed: {}", e),
        }
    }
}

/// Run one subscription until `token` is cancelled. A tick in progress is
/// allowed to finish.
async fn run_single(sub: Box<dyn ReactiveSubscription>, token: CancellationToken) {
    let name = sub.name();
    let delay = sub.initial_delay();
    if !delay.is_zero() {
        tracing::debug!(subscription = name, delay_secs = delay.as_secs(), "Delaying initial tick");
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let mut interval = tokio::time::interval(sub.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        sub.tick().await;
    }
    tracing::info!(subscription = name, "Subscription loop exited");
}

/// Spawn each subscription as its own task.
pub fn spawn_subscriptions(
    subscriptions: Vec<Box<dyn ReactiveSubscription>>,
    token: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    subscriptions
        .into_iter()
        .map(|sub| tokio::spawn(run_single(sub, token.clone())))
        .collect()
}

/// Handle to the running maintenance subscriptions.
pub struct MaintenanceLoop {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl MaintenanceLoop {
    pub fn start(pool: DbPool, config: &MaintenanceConfig) -> Self {
        let token = CancellationToken::new();
        let initial_delay = Duration::from_secs(config.initial_delay_secs);
        let subscriptions: Vec<Box<dyn ReactiveSubscription>> = vec![
            Box::new(RepairSubscription {
                pool: pool.clone(),
                interval: Duration::from_secs(config.repair_interval_secs.max(1)),
                initial_delay,
            }),
            Box::new(CheckpointSubscription {
                pool,
                interval: Duration::from_secs(config.checkpoint_interval_secs.max(1)),
                initial_delay,
            }),
        ];
        tracing::info!(
            repair_interval_secs = config.repair_interval_secs,
            checkpoint_interval_secs = config.checkpoint_interval_secs,
            "Maintenance loop started"
        );
        let handles = spawn_subscriptions(subscriptions, &token);
        Self { token, handles }
    }

    pub async fn stop(self) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("Maintenance task ended abnormally: {}", e);
            }
        }
        tracing::info!("Maintenance loop stopped");
    }
}
