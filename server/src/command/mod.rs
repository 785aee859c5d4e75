//! Command dispatch and the command log
//!
//! This module handles:
//! - Sending directives and movement commands to specific devices
//! - Broadcasting a directive to every device of a role
//! - Recording every command and its delivery outcome

mod dispatcher;
mod log;

pub use dispatcher::{Command, CommandDispatcher, CommandReceipt, ORIGIN_COORDINATOR, ORIGIN_DASHBOARD};
pub use log::{CommandLog, CommandLogEntry, DeliveryStatus};
