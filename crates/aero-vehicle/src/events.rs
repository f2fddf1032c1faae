use serde::Serialize;

use crate::calibration::{CalibrationKind, CalibrationOutcome, CalibrationProgress};

/// What collaborators (UI, loggers) observe from the vehicle services.
#[derive(Debug, Clone, PartialEq)]
pub enum VehicleEvent {
    ParameterUpdated { name: String },
    ParameterDownloadStarted,
    ParameterDownloadProgress { received: usize, expected: usize },
    ParameterDownloadCompleted { success: bool, received: usize, expected: Option<usize> },
    CalibrationProgress(CalibrationProgress),
    CalibrationFinished { kind: CalibrationKind, outcome: CalibrationOutcome },
    ArmedChanged { armed: bool },
    StatusMessage(StatusMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

impl Severity {
    /// MAV_SEVERITY numbering; anything out of range is treated as debug.
    pub fn from_wire(v: u8) -> Self {
        match v {
            0 => Severity::Emergency,
            1 => Severity::Alert,
            2 => Severity::Critical,
            3 => Severity::Error,
            4 => Severity::Warning,
            5 => Severity::Notice,
            6 => Severity::Info,
            _ => Severity::Debug,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusMessage {
    pub severity: Severity,
    pub text: String,
    /// False for messages generated locally (operation failures).
    pub from_vehicle: bool,
}

impl StatusMessage {
    pub fn local(severity: Severity, text: impl Into<String>) -> Self {
        Self { severity, text: text.into(), from_vehicle: false }
    }
}
