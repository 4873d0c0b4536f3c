pub mod messages;
pub mod sync;
pub mod threads;
pub mod watermarks;
