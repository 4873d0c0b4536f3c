//! Recurring per-account sync scheduler.
//!
//! One tokio interval drives `tick`. Each tick picks the due tasks, runs them
//! in batches of at most `max_concurrency`, and waits for a batch to finish
//! (plus a pause) before starting the next. Failures are recorded on the task
//! and on the account watermark; nothing escapes the loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::db::models::IncrementalSyncResult;
use crate::db::repos::{sync as sync_repo, watermarks as watermark_repo};
use crate::db::DbPool;
use crate::engine::context::AccountKey;
use crate::engine::registry::ContextRegistry;
use crate::engine::rotation::RotationLog;
use crate::engine::scheduler as sched_logic;
use crate::engine::sync::{SyncFunction, SyncRequest};
use crate::engine::types::{
    RotationRecord, ScheduledTask, SchedulerStatus, TaskRunOutcome, TaskSpec, TaskStatus,
};
use crate::error::AppError;

/// Runtime counters, shared with the loop task.
#[derive(Default)]
pub struct SchedulerState {
    running: AtomicBool,
    ticks: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

impl SchedulerState {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

struct SchedulerInner {
    config: SchedulerConfig,
    state: SchedulerState,
    tasks: Mutex<HashMap<String, ScheduledTask>>,
    rotations: Mutex<RotationLog>,
    registry: Arc<ContextRegistry>,
    pool: DbPool,
    sync_fn: Arc<dyn SyncFunction>,
}

pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
    loop_handle: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl TaskScheduler {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<ContextRegistry>,
        pool: DbPool,
        sync_fn: Arc<dyn SyncFunction>,
    ) -> Self {
        let rotations = RotationLog::new(config.rotation_history_limit);
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                state: SchedulerState::default(),
                tasks: Mutex::new(HashMap::new()),
                rotations: Mutex::new(rotations),
                registry,
                pool,
                sync_fn,
            }),
            loop_handle: Mutex::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // Task registry
    // -----------------------------------------------------------------------

    /// Register a recurring task. The first run is due immediately.
    pub async fn add_task(&self, spec: TaskSpec) -> Result<String, AppError> {
        let platform = spec.platform.trim();
        let account_id = spec.account_id.trim();
        if platform.is_empty() || account_id.is_empty() {
            return Err(AppError::Validation(
                "Task platform and account_id must not be empty".into(),
            ));
        }
        let interval_minutes = spec
            .interval_minutes
            .unwrap_or(self.inner.config.default_interval_minutes);
        if interval_minutes == 0 {
            return Err(AppError::Validation("interval_minutes must be at least 1".into()));
        }

        let key = AccountKey::new(platform, account_id);
        let mut tasks = self.inner.tasks.lock().await;
        if tasks.values().any(|t| t.account_key() == key) {
            return Err(AppError::DuplicateTask(key.to_string()));
        }

        let now = Utc::now();
        let task = ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            platform: key.platform.clone(),
            account_id: key.account_id.clone(),
            credential_ref: spec.credential_ref.clone(),
            interval_minutes,
            priority: spec.priority.unwrap_or(self.inner.config.default_priority),
            enabled: true,
            status: TaskStatus::Pending,
            last_sync_time: None,
            next_sync_time: now,
            sync_count: 0,
            error_count: 0,
            last_error: None,
            current_credential_ref: spec.credential_ref,
            initial_url: spec.initial_url,
            created_at: now,
        };
        let id = task.id.clone();
        tracing::info!(
            task_id = %id,
            account = %key,
            interval_minutes,
            priority = task.priority,
            "Sync task registered"
        );
        tasks.insert(id.clone(), task);
        Ok(id)
    }

    /// Unregister a task. A run already in flight finishes and is discarded.
    pub async fn remove_task(&self, task_id: &str) -> bool {
        let removed = self.inner.tasks.lock().await.remove(task_id);
        match &removed {
            Some(task) => tracing::info!(
                task_id,
                account = %task.account_key(),
                in_flight = task.status == TaskStatus::Running,
                "Sync task removed"
            ),
            None => tracing::debug!(task_id, "remove_task: no such task"),
        }
        removed.is_some()
    }

    /// Swap the credential used by the account's next run. Schedule and
    /// counters are left alone.
    pub async fn update_task_credential(
        &self,
        key: &AccountKey,
        new_credential_ref: &str,
        reason: &str,
    ) -> Result<(), AppError> {
        let previous = {
            let mut tasks = self.inner.tasks.lock().await;
            let task = tasks
                .values_mut()
                .find(|t| t.platform == key.platform && t.account_id == key.account_id)
                .ok_or_else(|| AppError::TaskNotFound(key.to_string()))?;
            task.current_credential_ref.replace(new_credential_ref.to_string())
        };

        tracing::info!(account = %key, reason, "Task credential rotated");
        self.inner
            .rotations
            .lock()
            .await
            .record(key, previous, new_credential_ref, reason);
        Ok(())
    }

    pub async fn set_task_enabled(&self, task_id: &str, enabled: bool) -> Result<(), AppError> {
        let mut tasks = self.inner.tasks.lock().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| AppError::TaskNotFound(task_id.to_string()))?;
        task.enabled = enabled;
        // A running task settles its own status when the run ends.
        if task.status != TaskStatus::Running {
            task.status = if enabled {
                TaskStatus::Pending
            } else {
                TaskStatus::Disabled
            };
        }
        tracing::info!(task_id, enabled, status = task.status.as_str(), "Sync task toggled");
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Option<ScheduledTask> {
        self.inner.tasks.lock().await.get(task_id).cloned()
    }

    pub async fn rotation_history(&self) -> Vec<RotationRecord> {
        self.inner.rotations.lock().await.snapshot()
    }

    /// Run one task immediately, outside the tick, with the usual bookkeeping.
    pub async fn run_task_now(&self, task_id: &str) -> Result<TaskRunOutcome, AppError> {
        if !self.inner.tasks.lock().await.contains_key(task_id) {
            return Err(AppError::TaskNotFound(task_id.to_string()));
        }
        Ok(self.inner.execute(task_id, false).await)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub async fn start(&self) {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_some() {
            tracing::debug!("Scheduler already running");
            return;
        }

        let token = CancellationToken::new();
        self.inner.state.running.store(true, Ordering::Relaxed);
        let join = tokio::spawn({
            let inner = self.inner.clone();
            let token = token.clone();
            async move { inner.run_loop(token).await }
        });
        *handle = Some((token, join));

        tracing::info!(
            poll_interval_ms = self.inner.config.poll_interval_ms,
            max_concurrency = self.inner.config.max_concurrency,
            "Scheduler started"
        );
    }

    /// Stop scheduling. Returns once the in-flight batch (if any) is done.
    pub async fn stop(&self) {
        let Some((token, join)) = self.loop_handle.lock().await.take() else {
            return;
        };
        token.cancel();
        if let Err(e) = join.await {
            tracing::error!("Scheduler loop ended abnormally: {}", e);
        }
        self.inner.state.running.store(false, Ordering::Relaxed);
        tracing::info!("Scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.is_running()
    }

    pub async fn get_scheduler_status(&self) -> SchedulerStatus {
        let state = &self.inner.state;
        let mut tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .await
            .values()
            .map(ScheduledTask::view)
            .collect();
        tasks.sort_by(|a, b| (&a.platform, &a.account_id).cmp(&(&b.platform, &b.account_id)));

        SchedulerStatus {
            running: state.is_running(),
            ticks: state.ticks.load(Ordering::Relaxed),
            succeeded: state.succeeded.load(Ordering::Relaxed),
            failed: state.failed.load(Ordering::Relaxed),
            discarded: state.discarded.load(Ordering::Relaxed),
            tasks,
        }
    }
}

impl SchedulerInner {
    async fn run_loop(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.tick(&token).await;
        }
        self.state.running.store(false, Ordering::Relaxed);
        tracing::debug!("Scheduler loop exited");
    }

    async fn tick(&self, token: &CancellationToken) {
        self.state.ticks.fetch_add(1, Ordering::Relaxed);

        let due = {
            let tasks = self.tasks.lock().await;
            sched_logic::select_due(&tasks, Utc::now())
        };
        if due.is_empty() {
            return;
        }

        let batches = sched_logic::partition_batches(&due, self.config.max_concurrency);
        tracing::debug!(due = due.len(), batches = batches.len(), "Scheduler tick");

        for (index, batch) in batches.iter().enumerate() {
            if index > 0 {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!(skipped_batches = batches.len() - index, "Stop requested, remaining batches skipped");
                        return;
                    }
                    _ = tokio::time::sleep(self.config.batch_pause()) => {}
                }
            }
            // An in-flight batch always runs to completion.
            join_all(batch.iter().map(|id| self.execute(id, true))).await;
        }
    }

    /// Claim and run one task. With `require_enabled`, a task disabled since
    /// it was selected is skipped.
    async fn execute(&self, task_id: &str, require_enabled: bool) -> TaskRunOutcome {
        let claim = {
            let mut tasks = self.tasks.lock().await;
            match tasks.get_mut(task_id) {
                Some(task)
                    if task.status != TaskStatus::Running && (task.enabled || !require_enabled) =>
                {
                    task.status = TaskStatus::Running;
                    Some((
                        task.account_key(),
                        task.current_credential_ref.clone(),
                        task.initial_url.clone(),
                    ))
                }
                _ => None,
            }
        };
        let Some((key, credential_ref, initial_url)) = claim else {
            return TaskRunOutcome::Skipped;
        };

        tracing::info!(task_id, account = %key, "Sync task started");
        let started = std::time::Instant::now();
        let result = self
            .run_once(task_id, &key, credential_ref, initial_url.as_deref())
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match result {
            Ok(Some(merged)) => Ok(merged),
            Ok(None) => return self.discard(task_id, &key),
            Err(e) => Err(e),
        };

        let now = Utc::now();
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(task_id) else {
            return self.discard(task_id, &key);
        };

        match result {
            Ok(merged) => {
                let partial_errors = merged.errors.len();
                let summary = (partial_errors > 0).then(|| merged.errors.join("; "));
                sched_logic::apply_success(task, now, summary);
                drop(tasks);
                self.state.succeeded.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    task_id,
                    account = %key,
                    elapsed_ms,
                    new_messages = merged.new_messages,
                    updated_threads = merged.updated_threads,
                    partial_errors,
                    "Sync task succeeded"
                );
                TaskRunOutcome::Succeeded {
                    new_messages: merged.new_messages,
                    partial_errors,
                }
            }
            Err(e) => {
                let error = e.to_string();
                sched_logic::apply_failure(task, now, error.clone());
                let error_count = task.error_count;
                drop(tasks);
                self.state.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(task_id, account = %key, elapsed_ms, error_count, "Sync task failed: {}", error);
                self.record_watermark_error(&key, &error).await;
                TaskRunOutcome::Failed { error }
            }
        }
    }

    fn discard(&self, task_id: &str, key: &AccountKey) -> TaskRunOutcome {
        self.state.discarded.fetch_add(1, Ordering::Relaxed);
        tracing::info!(task_id, account = %key, "Task removed during execution, result discarded");
        TaskRunOutcome::Discarded
    }

    /// Context -> sync function (under the task timeout) -> store.
    /// `Ok(None)` means the task vanished before its result was persisted.
    async fn run_once(
        &self,
        task_id: &str,
        key: &AccountKey,
        credential_ref: Option<String>,
        initial_url: Option<&str>,
    ) -> Result<Option<IncrementalSyncResult>, AppError> {
        let context_id = self
            .registry
            .get_or_create(key, initial_url, credential_ref.as_deref())
            .await?;

        let request = SyncRequest {
            task_id: task_id.to_string(),
            platform: key.platform.clone(),
            account_id: key.account_id.clone(),
            credential_ref,
            context_id,
            registry: self.registry.clone(),
        };

        // The context survives a timeout and is reused next cycle.
        let timeout = self.config.task_timeout();
        let outcome = match tokio::time::timeout(timeout, self.sync_fn.sync(request)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return Err(AppError::SyncFailure(e.to_string())),
            Err(_) => {
                return Err(AppError::SyncFailure(format!(
                    "timed out after {} ms",
                    timeout.as_millis()
                )))
            }
        };

        if !outcome.success {
            let detail = if outcome.errors.is_empty() {
                "sync function reported failure".to_string()
            } else {
                outcome.errors.join("; ")
            };
            return Err(AppError::SyncFailure(detail));
        }

        if !self.tasks.lock().await.contains_key(task_id) {
            return Ok(None);
        }

        let pool = self.pool.clone();
        let platform = key.platform.clone();
        let account_id = key.account_id.clone();
        let threads = outcome.threads;
        let mut merged = tokio::task::spawn_blocking(move || {
            sync_repo::incremental_sync(&pool, &platform, &account_id, &threads)
        })
        .await?
        .map_err(|e| AppError::StoreFailure(e.to_string()))?;

        merged.errors.extend(outcome.errors);
        Ok(Some(merged))
    }

    async fn record_watermark_error(&self, key: &AccountKey, error: &str) {
        let pool = self.pool.clone();
        let platform = key.platform.clone();
        let account_id = key.account_id.clone();
        let error = error.to_string();
        let recorded = tokio::task::spawn_blocking(move || {
            watermark_repo::record_error(&pool, &platform, &account_id, &error)
        })
        .await;
        match recorded {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(account = %key, "Failed to record sync error: {}", e),
            Err(e) => tracing::error!(account = %key, "Failed to record sync error: {}", e),
        }
    }
}
