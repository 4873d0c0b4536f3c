use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::db::fmt_ts;
use crate::engine::driver::{CookieStoreRef, PageDriver};

/// `(platform, account_id)`: keys both contexts and scheduled tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AccountKey {
    pub platform: String,
    pub account_id: String,
}

impl AccountKey {
    pub fn new(platform: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            account_id: account_id.into(),
        }
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.account_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    #[default]
    Unknown,
    LoggedIn,
    LoggedOut,
}

/// One isolated session. Owned by the registry; never handed out directly.
pub struct ExecutionContext {
    pub id: String,
    pub account_key: AccountKey,
    pub cookie_store: CookieStoreRef,
    pub driver: Arc<dyn PageDriver>,
    pub last_known_url: Option<String>,
    pub login_state: LoginState,
    pub created_at: DateTime<Utc>,
    pub credential_ref: Option<String>,
    /// Creation order; the lowest remaining value wins auto-activation.
    pub seq: u64,
    pub last_navigation_error: Option<String>,
}

impl ExecutionContext {
    pub fn status(&self, is_foreground: bool) -> ContextStatus {
        ContextStatus {
            id: self.id.clone(),
            platform: self.account_key.platform.clone(),
            account_id: self.account_key.account_id.clone(),
            url: self.last_known_url.clone(),
            login_state: self.login_state,
            is_foreground,
            credential_ref: self.credential_ref.clone(),
            last_navigation_error: self.last_navigation_error.clone(),
            created_at: fmt_ts(&self.created_at),
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("account_key", &self.account_key)
            .field("cookie_store", &self.cookie_store)
            .field("last_known_url", &self.last_known_url)
            .field("login_state", &self.login_state)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

/// Read-only snapshot of a context for status queries.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ContextStatus {
    pub id: String,
    pub platform: String,
    pub account_id: String,
    pub url: Option<String>,
    pub login_state: LoginState,
    pub is_foreground: bool,
    pub credential_ref: Option<String>,
    pub last_navigation_error: Option<String>,
    pub created_at: String,
}
