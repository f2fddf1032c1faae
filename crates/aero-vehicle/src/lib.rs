//! Vehicle-side services on top of a [`aero_link::LinkSession`]: parameter table sync,
//! acknowledged commands and sensor calibration.

pub mod calibration;
pub mod commands;
pub mod error;
pub mod events;
pub mod params;
pub mod profile;
pub mod safety;
mod vehicle;

pub use calibration::{CalibrationConfig, CalibrationKind, CalibrationOutcome, CalibrationProgress, CalibrationState, CalibrationStateMachine};
pub use commands::{CommandConfig, CommandDispatcher, Confirmations};
pub use error::{CommandError, PreconditionError, ProtocolError, ValidationError, VehicleError};
pub use events::{Severity, StatusMessage, VehicleEvent};
pub use params::{DownloadSnapshot, DroneParameter, ParamMetadata, ParamSyncConfig, ParameterSyncEngine, ProfileApplyReport};
pub use profile::{MemoryProfileStore, ProfileError, ProfileStore, ProfileValues};
pub use safety::{FailsafeAction, SafetySettings};
pub use vehicle::{Vehicle, VehicleConfig};
