//! In-crate doubles for the host, page driver and sync function.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::db::models::ThreadPayload;
use crate::engine::driver::{ContextHost, CookieStoreRef, PageDriver, PageEvent};
use crate::engine::sync::{SyncFunction, SyncRequest};
use crate::engine::types::SyncOutcome;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub enum NavBehavior {
    Load,
    Fail,
    Redirect(String),
    Silent,
    /// `navigate` itself never returns.
    Hang,
}

pub struct MockDriver {
    pub context_id: String,
    events: broadcast::Sender<PageEvent>,
    behavior: Mutex<NavBehavior>,
    script_result: Mutex<serde_json::Value>,
    pub visible: AtomicBool,
    pub layout_calls: AtomicU32,
    pub navigations: Mutex<Vec<String>>,
    pub closed: AtomicBool,
    pub fail_close: AtomicBool,
    pub fail_set_visible: AtomicBool,
}

impl MockDriver {
    pub fn new(context_id: &str) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            context_id: context_id.to_string(),
            events,
            behavior: Mutex::new(NavBehavior::Load),
            script_result: Mutex::new(serde_json::Value::Null),
            visible: AtomicBool::new(false),
            layout_calls: AtomicU32::new(0),
            navigations: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            fail_set_visible: AtomicBool::new(false),
        }
    }

    pub fn set_behavior(&self, behavior: NavBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn set_script_result(&self, value: serde_json::Value) {
        *self.script_result.lock().unwrap() = value;
    }
}

#[async_trait::async_trait]
impl PageDriver for MockDriver {
    async fn navigate(&self, url: &str) -> Result<(), AppError> {
        self.navigations.lock().unwrap().push(url.to_string());
        let behavior = self.behavior.lock().unwrap().clone();
        let event = match behavior {
            NavBehavior::Load => Some(PageEvent::LoadFinished { url: url.into() }),
            NavBehavior::Fail => Some(PageEvent::LoadFailed {
                url: url.into(),
                error: "ERR_NAME_NOT_RESOLVED".into(),
            }),
            NavBehavior::Redirect(to) => Some(PageEvent::Navigated { url: to }),
            NavBehavior::Silent => None,
            NavBehavior::Hang => {
                std::future::pending::<()>().await;
                None
            }
        };
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    async fn run_script(&self, _script: &str) -> Result<serde_json::Value, AppError> {
        Ok(self.script_result.lock().unwrap().clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
        self.events.subscribe()
    }

    async fn set_visible(&self, visible: bool) -> Result<(), AppError> {
        if self.fail_set_visible.load(Ordering::Relaxed) {
            return Err(AppError::Driver("view detached".into()));
        }
        self.visible.store(visible, Ordering::Relaxed);
        Ok(())
    }

    async fn apply_layout(&self) -> Result<(), AppError> {
        self.layout_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> Result<(), AppError> {
        if self.fail_close.load(Ordering::Relaxed) {
            return Err(AppError::Driver("close refused".into()));
        }
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockHost {
    pub fail_create_driver: AtomicBool,
    /// New drivers reject `set_visible`.
    pub fail_set_visible: AtomicBool,
    pub stores_created: AtomicU32,
    pub stores_destroyed: AtomicU32,
    pub loaded: Mutex<Vec<String>>,
    pub saved: Mutex<Vec<(String, String)>>,
    drivers: Mutex<Vec<Arc<MockDriver>>>,
}

impl MockHost {
    pub fn driver(&self, context_id: &str) -> Option<Arc<MockDriver>> {
        self.drivers
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.context_id == context_id)
            .cloned()
    }

    pub fn last_driver(&self) -> Option<Arc<MockDriver>> {
        self.drivers.lock().unwrap().last().cloned()
    }
}

#[async_trait::async_trait]
impl ContextHost for MockHost {
    async fn create_cookie_store(&self, partition: &str) -> Result<CookieStoreRef, AppError> {
        self.stores_created.fetch_add(1, Ordering::Relaxed);
        Ok(CookieStoreRef(partition.to_string()))
    }

    async fn load_credential(&self, _store: &CookieStoreRef, credential_ref: &str) -> Result<(), AppError> {
        self.loaded.lock().unwrap().push(credential_ref.to_string());
        Ok(())
    }

    async fn save_credential(&self, store: &CookieStoreRef, credential_ref: &str) -> Result<(), AppError> {
        self.saved
            .lock()
            .unwrap()
            .push((store.0.clone(), credential_ref.to_string()));
        Ok(())
    }

    async fn create_driver(
        &self,
        context_id: &str,
        _store: &CookieStoreRef,
    ) -> Result<Arc<dyn PageDriver>, AppError> {
        if self.fail_create_driver.load(Ordering::Relaxed) {
            return Err(AppError::Driver("renderer crashed".into()));
        }
        let driver = Arc::new(MockDriver::new(context_id));
        if self.fail_set_visible.load(Ordering::Relaxed) {
            driver.fail_set_visible.store(true, Ordering::Relaxed);
        }
        self.drivers.lock().unwrap().push(driver.clone());
        Ok(driver)
    }

    async fn destroy_cookie_store(&self, _store: &CookieStoreRef) -> Result<(), AppError> {
        self.stores_destroyed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum SyncBehavior {
    Succeed(Vec<ThreadPayload>),
    Report(Vec<String>),
    Error(String),
    Hang,
}

pub struct MockSync {
    behavior: Mutex<SyncBehavior>,
    delay: Duration,
    pub calls: AtomicU32,
    pub seen_credentials: Mutex<Vec<Option<String>>>,
}

impl MockSync {
    pub fn new(behavior: SyncBehavior) -> Self {
        Self::with_delay(behavior, Duration::ZERO)
    }

    pub fn with_delay(behavior: SyncBehavior, delay: Duration) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            delay,
            calls: AtomicU32::new(0),
            seen_credentials: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: SyncBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }
}

#[async_trait::async_trait]
impl SyncFunction for MockSync {
    async fn sync(&self, request: SyncRequest) -> Result<SyncOutcome, AppError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.seen_credentials
            .lock()
            .unwrap()
            .push(request.credential_ref.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            SyncBehavior::Succeed(threads) => Ok(SyncOutcome {
                success: true,
                threads,
                errors: Vec::new(),
            }),
            SyncBehavior::Report(errors) => Ok(SyncOutcome {
                success: false,
                threads: Vec::new(),
                errors,
            }),
            SyncBehavior::Error(e) => Err(AppError::Driver(e)),
            SyncBehavior::Hang => std::future::pending().await,
        }
    }
}
