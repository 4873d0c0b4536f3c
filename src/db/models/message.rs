use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Messages
// ============================================================================

/// Who authored a message: the account owner or the remote party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum MessageSender {
    Me,
    User,
}

impl MessageSender {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageSender::Me => "me",
            MessageSender::User => "user",
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, MessageSender::User)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Message {
    pub id: i64,
    pub thread_id: i64,
    pub message_id: Option<String>,
    pub sender: String,
    pub content_type: String,
    pub text_content: Option<String>,
    /// JSON array of image URLs.
    pub image_urls: Option<String>,
    pub content_hash: Option<String>,
    pub timestamp: String,
    pub is_read: bool,
    pub created_at: String,
}

/// A message as delivered by a sync function, before persistence.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct NewMessage {
    pub message_id: Option<String>,
    pub sender: MessageSender,
    pub content_type: Option<String>,
    pub text_content: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    pub content_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

impl NewMessage {
    pub fn text(sender: MessageSender, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            message_id: None,
            sender,
            content_type: None,
            text_content: Some(text.into()),
            image_urls: Vec::new(),
            content_hash: None,
            timestamp,
            is_read: false,
        }
    }
}

/// Outcome of appending a batch of messages to one thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub struct AppendResult {
    pub inserted: usize,
    pub skipped: usize,
}
