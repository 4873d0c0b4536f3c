//! Boundary traits for the page host.
//!
//! The orchestrator never inspects page content. Everything it knows about a
//! page arrives through [`PageDriver`] calls and the [`PageEvent`] stream, and
//! every isolated session is built by a [`ContextHost`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::AppError;

/// Opaque handle to a host-side cookie partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CookieStoreRef(pub String);

impl fmt::Display for CookieStoreRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Load lifecycle signals emitted by a page driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PageEvent {
    /// Content finished loading.
    LoadFinished { url: String },
    /// The load failed (network error, aborted, blocked).
    LoadFailed { url: String, error: String },
    /// The page moved to a new URL mid-flight (redirect or client-side hop).
    Navigated { url: String },
}

/// One live page bound to a single cookie partition.
#[async_trait::async_trait]
pub trait PageDriver: Send + Sync {
    /// Start loading `url`. Returns once the request is issued; completion
    /// is reported through [`PageDriver::subscribe`].
    async fn navigate(&self, url: &str) -> Result<(), AppError>;

    /// Evaluate a script in the page and return its JSON result.
    async fn run_script(&self, script: &str) -> Result<serde_json::Value, AppError>;

    /// Subscribe to load events. Only events sent after the call are seen.
    fn subscribe(&self) -> broadcast::Receiver<PageEvent>;

    async fn set_visible(&self, visible: bool) -> Result<(), AppError>;

    /// Re-apply host layout and input focus.
    async fn apply_layout(&self) -> Result<(), AppError>;

    async fn close(&self) -> Result<(), AppError>;
}

/// Factory for isolated sessions.
#[async_trait::async_trait]
pub trait ContextHost: Send + Sync {
    async fn create_cookie_store(&self, partition: &str) -> Result<CookieStoreRef, AppError>;

    /// Seed the cookie store from a stored credential.
    async fn load_credential(
        &self,
        store: &CookieStoreRef,
        credential_ref: &str,
    ) -> Result<(), AppError>;

    /// Persist the cookie store's current state under `credential_ref`.
    async fn save_credential(
        &self,
        store: &CookieStoreRef,
        credential_ref: &str,
    ) -> Result<(), AppError>;

    async fn create_driver(
        &self,
        context_id: &str,
        store: &CookieStoreRef,
    ) -> Result<Arc<dyn PageDriver>, AppError>;

    async fn destroy_cookie_store(&self, store: &CookieStoreRef) -> Result<(), AppError>;
}
