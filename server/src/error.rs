//! Error taxonomy for the coordination core

use fleet_shared::codec::CodecError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Device {device_id} is not a claimant of task {task_id}")]
    NotClaimant { task_id: String, device_id: String },

    #[error("Unknown issue type: {0}")]
    UnknownIssueType(String),

    #[error("No robots available for task {task_id}: need {required}, {available} idle")]
    NoRobotsAvailable {
        task_id: String,
        required: usize,
        available: usize,
    },

    #[error("Delivery to {device_id} failed after {attempts} attempt(s): {reason}")]
    DeliveryFailed {
        device_id: String,
        attempts: u32,
        reason: String,
    },
}

impl From<CodecError> for CoreError {
    fn from(err: CodecError) -> Self {
        CoreError::MalformedMessage(err.to_string())
    }
}
