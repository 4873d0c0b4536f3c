pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;

use std::sync::Arc;

use tokio::sync::Mutex;

pub use config::OrchestratorConfig;
pub use error::AppError;

use db::models::{HealthReport, RepairReport};
use db::repos::sync as sync_repo;
use db::DbPool;
use engine::{ContextHost, ContextRegistry, MaintenanceLoop, SyncFunction, TaskScheduler};

/// Composition root: store, context registry, scheduler and maintenance,
/// wired from one config.
pub struct Orchestrator {
    pub config: OrchestratorConfig,
    pub pool: DbPool,
    pub registry: Arc<ContextRegistry>,
    pub scheduler: Arc<TaskScheduler>,
    maintenance: Mutex<Option<MaintenanceLoop>>,
}

impl Orchestrator {
    /// Open the store, build the registry and scheduler, and start the
    /// background loops.
    pub async fn start(
        config: OrchestratorConfig,
        host: Arc<dyn ContextHost>,
        sync_fn: Arc<dyn SyncFunction>,
    ) -> Result<Self, AppError> {
        config.validate()?;
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            data_dir = %config.data_dir.display(),
            "Starting orchestrator"
        );

        let pool = {
            let data_dir = config.data_dir.clone();
            let store = config.store.clone();
            tokio::task::spawn_blocking(move || db::init_db(&data_dir, &store)).await??
        };
        tracing::info!(max_size = config.store.pool_size, "Database pool ready");

        let registry = Arc::new(ContextRegistry::new(
            host,
            config.registry.clone(),
            config.navigation.clone(),
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            config.scheduler.clone(),
            registry.clone(),
            pool.clone(),
            sync_fn,
        ));
        scheduler.start().await;

        let maintenance = if config.maintenance.enabled {
            Some(MaintenanceLoop::start(pool.clone(), &config.maintenance))
        } else {
            tracing::info!("Maintenance loop disabled");
            None
        };

        Ok(Self {
            config,
            pool,
            registry,
            scheduler,
            maintenance: Mutex::new(maintenance),
        })
    }

    /// Ordered shutdown: stop scheduling (waiting for the in-flight batch),
    /// stop maintenance, close every context, checkpoint the WAL.
    pub async fn shutdown(&self) {
        tracing::info!("Orchestrator shutting down");
        self.scheduler.stop().await;
        if let Some(maintenance) = self.maintenance.lock().await.take() {
            maintenance.stop().await;
        }
        self.registry.close_all().await;

        let pool = self.pool.clone();
        match tokio::task::spawn_blocking(move || db::checkpoint(&pool)).await {
            Ok(Ok(result)) => tracing::debug!(?result, "Shutdown WAL checkpoint complete"),
            Ok(Err(e)) => tracing::warn!("Shutdown WAL checkpoint failed: {}", e),
            Err(e) => tracing::warn!("Shutdown WAL checkpoint task failed: {}", e),
        }
        tracing::info!("Orchestrator stopped");
    }

    pub async fn health_check(&self) -> Result<HealthReport, AppError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || sync_repo::health_check(&pool)).await?
    }

    pub async fn repair_consistency(&self) -> Result<RepairReport, AppError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || sync_repo::repair_consistency(&pool)).await?
    }
}
