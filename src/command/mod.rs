//! Command execution for the simulated device
//!
//! This module handles:
//! - Accepting base-station connections on the command port
//! - Dispatching movement commands and directives
//! - Acknowledging commands and reporting task completion

mod executor;
mod listener;

pub use executor::{CommandExecutor, CommandResult};
pub use listener::serve;
