use std::sync::Arc;

use crate::engine::registry::ContextRegistry;
use crate::engine::types::SyncOutcome;
use crate::error::AppError;

/// Everything a platform sync needs for one run. The context already exists
/// when the request is built; the function drives it through `registry`.
#[derive(Clone)]
pub struct SyncRequest {
    pub task_id: String,
    pub platform: String,
    pub account_id: String,
    pub credential_ref: Option<String>,
    pub context_id: String,
    pub registry: Arc<ContextRegistry>,
}

/// Platform-specific synchronization, injected into the scheduler.
///
/// Returning `Err` or an outcome with `success == false` counts as a failed
/// run. The scheduler bounds each call with its task timeout.
#[async_trait::async_trait]
pub trait SyncFunction: Send + Sync {
    async fn sync(&self, request: SyncRequest) -> Result<SyncOutcome, AppError>;
}
