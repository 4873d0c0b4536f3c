pub mod background;
pub mod context;
pub mod driver;
pub mod navigation;
pub mod polling;
pub mod registry;
pub mod rotation;
pub mod scheduler;
pub mod subscription;
pub mod sync;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use background::TaskScheduler;
pub use context::{AccountKey, ContextStatus, LoginState};
pub use driver::{ContextHost, CookieStoreRef, PageDriver, PageEvent};
pub use navigation::Settlement;
pub use registry::ContextRegistry;
pub use subscription::MaintenanceLoop;
pub use sync::{SyncFunction, SyncRequest};
pub use types::{SchedulerStatus, SyncOutcome, TaskRunOutcome, TaskSpec, TaskStatus};
