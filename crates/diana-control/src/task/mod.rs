//! 任务：记录、调度与引擎

mod engine;
mod record;
mod scheduler;

pub use engine::TaskEngine;
pub use record::{TaskId, TaskSnapshot, TaskState, epoch_ms};
