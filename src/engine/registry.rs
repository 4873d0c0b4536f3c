//! Owner of every live execution context.
//!
//! Lock order is: per-account key lock, then the foreground lock, then the
//! `inner` map lock. The map lock is never held across a driver or host call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::config::{NavigationConfig, RegistryConfig};
use crate::engine::context::{AccountKey, ContextStatus, ExecutionContext, LoginState};
use crate::engine::driver::{ContextHost, CookieStoreRef, PageDriver};
use crate::engine::navigation::{NavigationWait, Settlement};
use crate::engine::polling::{poll_until, PollPolicy};
use crate::error::AppError;

/// Page loaded when a driver refuses to close.
const BLANK_URL: &str = "about:blank";

#[derive(Default)]
struct RegistryInner {
    contexts: HashMap<String, ExecutionContext>,
    by_account: HashMap<AccountKey, String>,
    foreground: Option<String>,
}

pub struct ContextRegistry {
    host: Arc<dyn ContextHost>,
    config: RegistryConfig,
    navigation: NavigationConfig,
    inner: RwLock<RegistryInner>,
    key_locks: Mutex<HashMap<AccountKey, Arc<Mutex<()>>>>,
    foreground_lock: Mutex<()>,
    next_seq: AtomicU64,
}

impl ContextRegistry {
    pub fn new(
        host: Arc<dyn ContextHost>,
        config: RegistryConfig,
        navigation: NavigationConfig,
    ) -> Self {
        Self {
            host,
            config,
            navigation,
            inner: RwLock::new(RegistryInner::default()),
            key_locks: Mutex::new(HashMap::new()),
            foreground_lock: Mutex::new(()),
            next_seq: AtomicU64::new(0),
        }
    }

    async fn key_lock(&self, key: &AccountKey) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks.entry(key.clone()).or_default().clone()
    }

    /// Drop the per-key lock once nobody else holds or waits on it. Callers
    /// must have released their own handle first.
    async fn prune_key_lock(&self, key: &AccountKey) {
        let mut locks = self.key_locks.lock().await;
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Create a context for `key`. Fails with `DuplicateContext` if one is
    /// already live.
    pub async fn acquire(
        &self,
        key: &AccountKey,
        initial_url: Option<&str>,
        credential_ref: Option<&str>,
    ) -> Result<String, AppError> {
        let lock = self.key_lock(key).await;
        let _guard = lock.lock().await;
        self.acquire_locked(key, initial_url, credential_ref).await
    }

    /// Return the live context for `key`, creating it if needed.
    pub async fn get_or_create(
        &self,
        key: &AccountKey,
        url: Option<&str>,
        credential_ref: Option<&str>,
    ) -> Result<String, AppError> {
        let lock = self.key_lock(key).await;
        let _guard = lock.lock().await;
        if let Some(id) = self.context_for(key).await {
            tracing::debug!(account = %key, context_id = %id, "Reusing execution context");
            return Ok(id);
        }
        self.acquire_locked(key, url, credential_ref).await
    }

    async fn acquire_locked(
        &self,
        key: &AccountKey,
        initial_url: Option<&str>,
        credential_ref: Option<&str>,
    ) -> Result<String, AppError> {
        if self.context_for(key).await.is_some() {
            return Err(AppError::DuplicateContext(key.to_string()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        tracing::info!(account = %key, context_id = %id, "Creating execution context");

        let store = self
            .host
            .create_cookie_store(&format!("persist:{key}"))
            .await?;

        let driver = match self.build_driver(&id, &store, credential_ref).await {
            Ok(driver) => driver,
            Err(e) => {
                tracing::warn!(account = %key, context_id = %id, "Context construction failed, rolling back: {}", e);
                self.destroy_store(&store).await;
                return Err(e);
            }
        };

        let mut ctx = ExecutionContext {
            id: id.clone(),
            account_key: key.clone(),
            cookie_store: store,
            driver: driver.clone(),
            last_known_url: None,
            login_state: LoginState::Unknown,
            created_at: chrono::Utc::now(),
            credential_ref: credential_ref.map(String::from),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            last_navigation_error: None,
        };

        if let Some(url) = initial_url {
            let settlement = self.drive_navigation(&id, driver.as_ref(), url).await;
            record_settlement(&mut ctx, &settlement);
        }

        let mut inner = self.inner.write().await;
        inner.by_account.insert(key.clone(), id.clone());
        inner.contexts.insert(id.clone(), ctx);
        tracing::info!(
            account = %key,
            context_id = %id,
            live = inner.contexts.len(),
            "Execution context ready"
        );
        Ok(id)
    }

    /// Load the credential, open the driver and park it in the background.
    /// On failure the partially built driver is closed; the caller destroys
    /// the cookie store.
    async fn build_driver(
        &self,
        id: &str,
        store: &CookieStoreRef,
        credential_ref: Option<&str>,
    ) -> Result<Arc<dyn PageDriver>, AppError> {
        if let Some(cred) = credential_ref {
            self.host.load_credential(store, cred).await?;
        }
        let driver = self.host.create_driver(id, store).await?;
        if let Err(e) = driver.set_visible(false).await {
            if let Err(close_err) = driver.close().await {
                tracing::debug!(context_id = %id, "Closing partial driver failed: {}", close_err);
            }
            return Err(e);
        }
        Ok(driver)
    }

    async fn destroy_store(&self, store: &CookieStoreRef) {
        if let Err(e) = self.host.destroy_cookie_store(store).await {
            tracing::warn!(store = %store, "Failed to destroy cookie store: {}", e);
        }
    }

    // -----------------------------------------------------------------------
    // Foreground
    // -----------------------------------------------------------------------

    /// Bring `context_id` to the foreground, hiding the previous one.
    pub async fn activate(&self, context_id: &str) -> Result<(), AppError> {
        let _fg = self.foreground_lock.lock().await;
        self.activate_locked(context_id).await
    }

    async fn activate_locked(&self, context_id: &str) -> Result<(), AppError> {
        let (driver, previous) = {
            let inner = self.inner.read().await;
            let ctx = inner
                .contexts
                .get(context_id)
                .ok_or_else(|| AppError::ContextNotFound(context_id.to_string()))?;
            let previous = inner
                .foreground
                .as_ref()
                .filter(|fg| fg.as_str() != context_id)
                .and_then(|fg| inner.contexts.get(fg))
                .map(|prev| (prev.id.clone(), prev.driver.clone()));
            (ctx.driver.clone(), previous)
        };

        if let Some((prev_id, prev_driver)) = &previous {
            if let Err(e) = prev_driver.set_visible(false).await {
                tracing::warn!(context_id = %prev_id, "Failed to hide previous foreground context: {}", e);
            }
        }

        if let Err(e) = driver.set_visible(true).await {
            tracing::warn!(context_id, "Failed to show context: {}", e);
            if let Some((prev_id, prev_driver)) = &previous {
                if let Err(e) = prev_driver.set_visible(true).await {
                    tracing::warn!(context_id = %prev_id, "Failed to restore previous foreground: {}", e);
                }
            }
            return Err(e);
        }

        self.inner.write().await.foreground = Some(context_id.to_string());
        tracing::info!(
            context_id,
            previous = previous.as_ref().map(|(id, _)| id.as_str()),
            "Context activated"
        );

        self.apply_layout_with_retry(context_id, driver).await;
        Ok(())
    }

    /// Apply layout now and once more after a short delay, so a host window
    /// that is still resizing ends up with the right bounds.
    async fn apply_layout_with_retry(&self, context_id: &str, driver: Arc<dyn PageDriver>) {
        if let Err(e) = driver.apply_layout().await {
            tracing::debug!(context_id, "Layout apply failed: {}", e);
        }
        let delay = self.config.focus_retry_delay();
        let context_id = context_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = driver.apply_layout().await {
                tracing::debug!(context_id = %context_id, "Layout retry failed: {}", e);
            }
        });
    }

    pub async fn foreground(&self) -> Option<String> {
        self.inner.read().await.foreground.clone()
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Close a context. The registry entry is always removed, even when the
    /// driver cannot be torn down cleanly.
    pub async fn close(&self, context_id: &str) -> Result<(), AppError> {
        let key = self
            .inner
            .read()
            .await
            .contexts
            .get(context_id)
            .map(|ctx| ctx.account_key.clone())
            .ok_or_else(|| AppError::ContextNotFound(context_id.to_string()))?;

        let lock = self.key_lock(&key).await;
        let guard = lock.lock().await;

        let ctx = {
            let _fg = self.foreground_lock.lock().await;
            let (ctx, successor) = {
                let mut inner = self.inner.write().await;
                let ctx = inner
                    .contexts
                    .remove(context_id)
                    .ok_or_else(|| AppError::ContextNotFound(context_id.to_string()))?;
                inner.by_account.remove(&ctx.account_key);

                let was_foreground = inner.foreground.as_deref() == Some(context_id);
                let successor = if was_foreground {
                    inner.foreground = None;
                    inner
                        .contexts
                        .values()
                        .min_by_key(|c| c.seq)
                        .map(|c| c.id.clone())
                } else {
                    None
                };
                (ctx, successor)
            };

            if let Some(next) = successor {
                if let Err(e) = self.activate_locked(&next).await {
                    tracing::warn!(context_id = %next, "Auto-activation after close failed: {}", e);
                }
            }
            ctx
        };

        self.teardown(&ctx).await;
        drop(guard);
        drop(lock);
        self.prune_key_lock(&key).await;
        tracing::info!(account = %key, context_id, "Execution context closed");
        Ok(())
    }

    async fn teardown(&self, ctx: &ExecutionContext) {
        let timeout = self.config.close_timeout();
        let closed = match tokio::time::timeout(timeout, ctx.driver.close()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(context_id = %ctx.id, "Driver close failed: {}", e);
                false
            }
            Err(_) => {
                tracing::warn!(context_id = %ctx.id, timeout_ms = timeout.as_millis() as u64, "Driver close timed out");
                false
            }
        };

        if !closed {
            match tokio::time::timeout(timeout, ctx.driver.navigate(BLANK_URL)).await {
                Ok(Ok(())) => tracing::debug!(context_id = %ctx.id, "Fell back to blank page"),
                Ok(Err(e)) => tracing::warn!(context_id = %ctx.id, "Blank page fallback failed: {}", e),
                Err(_) => tracing::warn!(context_id = %ctx.id, "Blank page fallback timed out"),
            }
        }

        self.destroy_store(&ctx.cookie_store).await;
    }

    /// Close every context, oldest first.
    pub async fn close_all(&self) {
        let mut ids: Vec<(u64, String)> = self
            .inner
            .read()
            .await
            .contexts
            .values()
            .map(|c| (c.seq, c.id.clone()))
            .collect();
        ids.sort();

        for (_, id) in ids {
            if let Err(e) = self.close(&id).await {
                tracing::warn!(context_id = %id, "Close during teardown failed: {}", e);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Page operations
    // -----------------------------------------------------------------------

    async fn driver_of(&self, context_id: &str) -> Result<(AccountKey, Arc<dyn PageDriver>), AppError> {
        let inner = self.inner.read().await;
        let ctx = inner
            .contexts
            .get(context_id)
            .ok_or_else(|| AppError::ContextNotFound(context_id.to_string()))?;
        Ok((ctx.account_key.clone(), ctx.driver.clone()))
    }

    pub async fn run_script(
        &self,
        context_id: &str,
        script: &str,
    ) -> Result<serde_json::Value, AppError> {
        let (_, driver) = self.driver_of(context_id).await?;
        driver.run_script(script).await
    }

    /// Navigate and wait for settlement. Only an unknown context is an error;
    /// load failures and timeouts come back as a [`Settlement`] and are
    /// recorded on the context.
    pub async fn navigate(&self, context_id: &str, url: &str) -> Result<Settlement, AppError> {
        let (key, driver) = self.driver_of(context_id).await?;
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        let settlement = self.drive_navigation(context_id, driver.as_ref(), url).await;

        let mut inner = self.inner.write().await;
        match inner.contexts.get_mut(context_id) {
            Some(ctx) => record_settlement(ctx, &settlement),
            None => tracing::debug!(context_id, "Context closed during navigation"),
        }
        Ok(settlement)
    }

    async fn drive_navigation(&self, context_id: &str, driver: &dyn PageDriver, url: &str) -> Settlement {
        let wait = NavigationWait::new(context_id, url, &self.navigation);
        // Subscribe first so a fast LoadFinished cannot be missed.
        let events = driver.subscribe();
        tracing::debug!(context_id, url, "Navigating");
        match tokio::time::timeout_at(wait.hard_deadline(), driver.navigate(url)).await {
            Ok(Ok(())) => wait.settle(events).await,
            Ok(Err(e)) => wait.abort(e.to_string()),
            Err(_) => {
                tracing::warn!(context_id, url, "Driver navigate call outlived the hard timeout");
                wait.expire()
            }
        }
    }

    // -----------------------------------------------------------------------
    // Session state
    // -----------------------------------------------------------------------

    pub async fn set_login_state(&self, context_id: &str, state: LoginState) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        let ctx = inner
            .contexts
            .get_mut(context_id)
            .ok_or_else(|| AppError::ContextNotFound(context_id.to_string()))?;
        if ctx.login_state != state {
            tracing::info!(context_id, from = ?ctx.login_state, to = ?state, "Login state changed");
        }
        ctx.login_state = state;
        Ok(())
    }

    /// Run `probe_script` until it returns a boolean (`true` = logged in) and
    /// record the result. Gives up as `Unknown` after the configured attempts.
    pub async fn detect_login_state(
        &self,
        context_id: &str,
        probe_script: &str,
    ) -> Result<LoginState, AppError> {
        let (_, driver) = self.driver_of(context_id).await?;
        let policy = PollPolicy::new(
            self.config.login_probe_attempts,
            self.config.login_probe_initial_backoff(),
        );

        let probed = poll_until("login_probe", &policy, |_| {
            let driver = driver.clone();
            async move {
                let value = driver.run_script(probe_script).await?;
                Ok::<_, AppError>(value.as_bool())
            }
        })
        .await;

        let state = match probed {
            Ok(Some(true)) => LoginState::LoggedIn,
            Ok(Some(false)) => LoginState::LoggedOut,
            Ok(None) => LoginState::Unknown,
            Err(e) => {
                tracing::warn!(context_id, "Login probe failed: {}", e);
                LoginState::Unknown
            }
        };
        self.set_login_state(context_id, state).await?;
        Ok(state)
    }

    /// Persist the context's cookies under `credential_ref`.
    pub async fn save_credential(&self, context_id: &str, credential_ref: &str) -> Result<(), AppError> {
        let store = {
            let inner = self.inner.read().await;
            inner
                .contexts
                .get(context_id)
                .map(|c| c.cookie_store.clone())
                .ok_or_else(|| AppError::ContextNotFound(context_id.to_string()))?
        };
        self.host.save_credential(&store, credential_ref).await?;

        if let Some(ctx) = self.inner.write().await.contexts.get_mut(context_id) {
            ctx.credential_ref = Some(credential_ref.to_string());
        }
        tracing::info!(context_id, credential_ref, "Credential saved");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn context_for(&self, key: &AccountKey) -> Option<String> {
        self.inner.read().await.by_account.get(key).cloned()
    }

    pub async fn status(&self, context_id: &str) -> Result<ContextStatus, AppError> {
        let inner = self.inner.read().await;
        let ctx = inner
            .contexts
            .get(context_id)
            .ok_or_else(|| AppError::ContextNotFound(context_id.to_string()))?;
        Ok(ctx.status(inner.foreground.as_deref() == Some(context_id)))
    }

    /// Status of every live context in creation order.
    pub async fn get_all_status(&self) -> Vec<ContextStatus> {
        let inner = self.inner.read().await;
        let mut contexts: Vec<&ExecutionContext> = inner.contexts.values().collect();
        contexts.sort_by_key(|c| c.seq);
        contexts
            .into_iter()
            .map(|c| c.status(inner.foreground.as_deref() == Some(c.id.as_str())))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.contexts.len()
    }
}

fn record_settlement(ctx: &mut ExecutionContext, settlement: &Settlement) {
    ctx.last_known_url = Some(settlement.url().to_string());
    ctx.last_navigation_error = settlement.error();
    if let Some(error) = &ctx.last_navigation_error {
        tracing::warn!(context_id = %ctx.id, url = settlement.url(), "Navigation did not load cleanly: {}", error);
    }
}
