use aero_link::{Fanout, LinkSession, Subscription};
use aero_proto::Target;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::calibration::{CalibrationConfig, CalibrationKind, CalibrationStateMachine};
use crate::commands::{CommandConfig, CommandDispatcher};
use crate::error::VehicleError;
use crate::events::{Severity, StatusMessage, VehicleEvent};
use crate::params::{DownloadSnapshot, ParamSyncConfig, ParameterSyncEngine};
use crate::safety::SafetySettings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleConfig {
    pub target: Target,
    pub params: ParamSyncConfig,
    pub commands: CommandConfig,
    pub calibration: CalibrationConfig,
}

/// One autopilot behind one link session. Owns the background tasks of its services and
/// stops them on drop.
///
/// The convenience operations below also publish a [`VehicleEvent::StatusMessage`] when
/// they fail, for UIs that only watch the event stream.
pub struct Vehicle {
    session: LinkSession,
    events: Fanout<VehicleEvent>,
    params: Arc<ParameterSyncEngine>,
    commands: Arc<CommandDispatcher>,
    calibration: Arc<CalibrationStateMachine>,
    safety: SafetySettings,
    tasks: Vec<JoinHandle<()>>,
}

impl Vehicle {
    /// Must be called inside a tokio runtime.
    pub fn new(session: LinkSession, config: VehicleConfig, safety: SafetySettings) -> Self {
        let events = Fanout::new();
        let mut commands_cfg = config.commands;
        commands_cfg.require_arming_confirmation = safety.require_arming_confirmation;
        commands_cfg.require_propeller_removal_confirmation = safety.require_propeller_removal_confirmation;

        let params = ParameterSyncEngine::new(session.clone(), config.target, config.params, events.clone());
        let commands = CommandDispatcher::new(session.clone(), config.target, commands_cfg, events.clone());
        let calibration = CalibrationStateMachine::new(session.clone(), commands.clone(), config.calibration, events.clone());
        let tasks = vec![params.start(), commands.start(), calibration.start()];

        Self { session, events, params, commands, calibration, safety, tasks }
    }

    pub fn session(&self) -> &LinkSession {
        &self.session
    }

    pub fn params(&self) -> &Arc<ParameterSyncEngine> {
        &self.params
    }

    pub fn commands(&self) -> &Arc<CommandDispatcher> {
        &self.commands
    }

    pub fn calibration(&self) -> &Arc<CalibrationStateMachine> {
        &self.calibration
    }

    pub fn safety(&self) -> &SafetySettings {
        &self.safety
    }

    pub fn subscribe_events(&self) -> Subscription<VehicleEvent> {
        self.events.subscribe()
    }

    pub async fn refresh_parameters(&self) -> Result<DownloadSnapshot, VehicleError> {
        self.report("parameter download", self.params.refresh_parameters().await)
    }

    pub async fn set_parameter(&self, name: &str, value: f32) -> Result<(), VehicleError> {
        self.report(&format!("set {}", name), self.params.set_parameter(name, value).await)
    }

    pub async fn arm(&self, force: bool) -> Result<(), VehicleError> {
        self.report("arm", self.commands.arm(force).await)
    }

    pub async fn disarm(&self, force: bool) -> Result<(), VehicleError> {
        self.report("disarm", self.commands.disarm(force).await)
    }

    pub async fn reboot(&self) -> Result<(), VehicleError> {
        self.report("reboot", self.commands.reboot().await)
    }

    pub async fn shutdown(&self) -> Result<(), VehicleError> {
        self.report("shutdown", self.commands.shutdown().await)
    }

    pub async fn motor_test(&self, motor: u8, throttle_percent: f32, duration: Duration) -> Result<(), VehicleError> {
        self.report("motor test", self.commands.motor_test(motor, throttle_percent, duration).await)
    }

    pub async fn stop_all_motors(&self) -> Result<(), VehicleError> {
        self.report("stop motors", self.commands.stop_all_motors().await)
    }

    pub async fn calibrate(&self, kind: CalibrationKind) -> Result<(), VehicleError> {
        self.report(&format!("{} calibration", kind), self.calibration.calibrate(kind).await)
    }

    /// Validate the held safety settings and write them to the vehicle. Returns how many
    /// parameters were written.
    pub async fn apply_safety_settings(&self) -> Result<usize, VehicleError> {
        self.report("apply safety settings", self.write_safety_settings().await)
    }

    async fn write_safety_settings(&self) -> Result<usize, VehicleError> {
        self.safety.validate()?;
        let params = self.safety.to_parameters();
        for (name, value) in &params {
            self.params.set_parameter(name, *value).await?;
        }
        info!("safety settings applied ({} parameters)", params.len());
        Ok(params.len())
    }

    fn report<T>(&self, what: &str, result: Result<T, VehicleError>) -> Result<T, VehicleError> {
        if let Err(e) = &result {
            let severity = match e {
                VehicleError::Validation(_) | VehicleError::Precondition(_) | VehicleError::Concurrency(_) => Severity::Warning,
                _ => Severity::Error,
            };
            self.events.publish(VehicleEvent::StatusMessage(StatusMessage::local(severity, format!("{} failed: {}", what, e))));
        }
        result
    }
}

impl Drop for Vehicle {
    fn drop(&mut self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}
