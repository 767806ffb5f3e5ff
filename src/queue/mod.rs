//! Persistent command queue.

pub mod lock;
pub mod migrations;
pub mod model;
pub mod store;

pub use lock::QueueLock;
pub use model::{Command, CommandStatus, QueueStats};
pub use store::CommandQueue;
