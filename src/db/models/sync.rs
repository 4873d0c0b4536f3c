use serde::{Deserialize, Serialize};
use ts_rs::TS;

use super::{NewMessage, ThreadAttrs};

// ============================================================================
// Incremental sync payloads and reports
// ============================================================================

/// One thread as scraped by a sync function, with its visible messages.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ThreadPayload {
    pub user_id: String,
    #[serde(flatten)]
    pub attrs: ThreadAttrs,
    #[serde(default)]
    pub messages: Vec<NewMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct IncrementalSyncResult {
    pub new_messages: usize,
    pub updated_threads: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RepairReport {
    /// Threads whose derived fields were recomputed.
    pub repaired_threads: usize,
    /// Threads whose derived fields actually differed before recomputation.
    pub drifted_threads: usize,
    pub orphaned_messages: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HealthReport {
    pub is_healthy: bool,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub orphaned_messages: i64,
    pub empty_threads: i64,
    pub inconsistent_threads: i64,
    pub integrity_ok: bool,
}
