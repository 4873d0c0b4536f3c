use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Message Threads
// ============================================================================

/// One conversation with a remote user on one account.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct MessageThread {
    pub id: i64,
    pub platform: String,
    pub account_id: String,
    pub user_id: String,
    pub user_name: String,
    pub avatar: Option<String>,
    pub unread_count: i64,
    pub last_message_text: Option<String>,
    pub last_message_time: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Unique identity of a thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ThreadKey {
    pub platform: String,
    pub account_id: String,
    pub user_id: String,
}

/// Mutable thread attributes applied on upsert.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ThreadAttrs {
    pub user_name: String,
    /// `None` keeps the stored avatar.
    pub avatar: Option<String>,
}
