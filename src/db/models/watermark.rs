use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Per-account sync progress. `last_sync_time` is the newest synced message
/// timestamp and never moves backwards.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncWatermark {
    pub platform: String,
    pub account_id: String,
    pub last_sync_time: Option<String>,
    pub sync_count: i64,
    pub last_error: Option<String>,
    pub updated_at: String,
}
