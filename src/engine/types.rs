use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::db::fmt_ts;
use crate::db::models::ThreadPayload;
use crate::engine::context::AccountKey;

/// Registration input for a recurring sync task. Unset fields take the
/// scheduler's configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TaskSpec {
    pub platform: String,
    pub account_id: String,
    pub credential_ref: Option<String>,
    pub interval_minutes: Option<u32>,
    pub priority: Option<i32>,
    /// Page opened when the task has to create its context.
    pub initial_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Disabled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: String,
    pub platform: String,
    pub account_id: String,
    /// Credential the task was registered with.
    pub credential_ref: Option<String>,
    pub interval_minutes: u32,
    pub priority: i32,
    pub enabled: bool,
    pub status: TaskStatus,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub next_sync_time: DateTime<Utc>,
    pub sync_count: u64,
    pub error_count: u32,
    pub last_error: Option<String>,
    /// Credential used for the next run; replaced by rotation.
    pub current_credential_ref: Option<String>,
    pub initial_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn account_key(&self) -> AccountKey {
        AccountKey::new(&self.platform, &self.account_id)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.status != TaskStatus::Running && self.next_sync_time <= now
    }

    pub fn view(&self) -> TaskStatusView {
        TaskStatusView {
            id: self.id.clone(),
            platform: self.platform.clone(),
            account_id: self.account_id.clone(),
            status: self.status,
            enabled: self.enabled,
            priority: self.priority,
            interval_minutes: self.interval_minutes,
            last_sync_time: self.last_sync_time.as_ref().map(fmt_ts),
            next_sync_time: fmt_ts(&self.next_sync_time),
            sync_count: self.sync_count,
            error_count: self.error_count,
            last_error: self.last_error.clone(),
            current_credential_ref: self.current_credential_ref.clone(),
        }
    }
}

/// What the injected sync function hands back for one account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub success: bool,
    #[serde(default)]
    pub threads: Vec<ThreadPayload>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct TaskStatusView {
    pub id: String,
    pub platform: String,
    pub account_id: String,
    pub status: TaskStatus,
    pub enabled: bool,
    pub priority: i32,
    pub interval_minutes: u32,
    pub last_sync_time: Option<String>,
    pub next_sync_time: String,
    #[ts(type = "number")]
    pub sync_count: u64,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub current_credential_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct SchedulerStatus {
    pub running: bool,
    #[ts(type = "number")]
    pub ticks: u64,
    #[ts(type = "number")]
    pub succeeded: u64,
    #[ts(type = "number")]
    pub failed: u64,
    #[ts(type = "number")]
    pub discarded: u64,
    pub tasks: Vec<TaskStatusView>,
}

/// How a single execution ended, from the scheduler's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskRunOutcome {
    Succeeded { new_messages: usize, partial_errors: usize },
    Failed { error: String },
    /// The task was removed while running; the result was dropped.
    Discarded,
    /// Already running (or gone before it started).
    Skipped,
}

#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct RotationRecord {
    pub account: String,
    pub previous_ref: Option<String>,
    pub new_ref: String,
    pub reason: String,
    pub rotated_at: String,
}
