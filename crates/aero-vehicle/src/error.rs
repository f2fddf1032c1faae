use aero_link::{ConcurrencyError, LinkError};

use crate::profile::ProfileError;

/// Client-side rejection. Nothing was sent to the device.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{name}={value} outside [{min}, {max}]")]
    OutOfRange { name: String, value: f32, min: f32, max: f32 },

    #[error("{name}: value {value} is not finite")]
    NotFinite { name: String, value: f32 },

    #[error("invalid parameter name `{0}`")]
    InvalidName(String),

    #[error("invalid settings: {0}")]
    Settings(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("write of {name} not confirmed after {attempts} attempts")]
    WriteNotConfirmed { name: String, attempts: u32 },

    #[error("no value received for {0}")]
    ReadNotAnswered(String),

    #[error("parameter download incomplete: {received} of {}", count_or_unknown(.expected))]
    DownloadIncomplete { received: usize, expected: Option<usize> },

    #[error("parameter download cancelled")]
    DownloadCancelled,

    #[error("{kind} calibration failed: {reason}")]
    CalibrationFailed { kind: String, reason: String },

    #[error("{kind} calibration cancelled")]
    CalibrationCancelled { kind: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("command {command} rejected: {} ({result})", result_label(.result))]
    Rejected { command: u16, result: u8 },

    #[error("command {command} not acknowledged in time")]
    Timeout { command: u16 },
}

/// Missing caller confirmation or unsafe vehicle state. Nothing was sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionError {
    #[error("arming requires explicit confirmation")]
    ArmingNotConfirmed,

    #[error("propeller removal must be confirmed first")]
    PropellerRemovalNotConfirmed,

    #[error("vehicle is armed")]
    VehicleArmed,

    #[error("no accelerometer calibration waiting for a position")]
    NoPositionRequested,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VehicleError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    #[error(transparent)]
    Profile(#[from] ProfileError),
}

/// MAV_RESULT names.
pub fn result_name(code: u8) -> &'static str {
    match code {
        0 => "ACCEPTED",
        1 => "TEMPORARILY_REJECTED",
        2 => "DENIED",
        3 => "UNSUPPORTED",
        4 => "FAILED",
        5 => "IN_PROGRESS",
        6 => "CANCELLED",
        _ => "UNKNOWN",
    }
}

fn result_label(code: &u8) -> &'static str {
    result_name(*code)
}

fn count_or_unknown(n: &Option<usize>) -> String {
    n.map_or_else(|| "?".to_string(), |n| n.to_string())
}
