mod message;
mod sync;
mod thread;
mod watermark;

pub use message::*;
pub use sync::*;
pub use thread::*;
pub use watermark::*;
