//! Task lifecycle and robot assignment
//!
//! This module handles:
//! - Creating tasks from issue reports
//! - Claiming robots atomically for a task
//! - Re-scanning queued tasks when robots become available
//! - Recording completion

mod availability;
mod engine;
mod task;

pub use availability::AvailabilityWorker;
pub use engine::TaskCoordinator;
pub use task::{Completion, Task};
