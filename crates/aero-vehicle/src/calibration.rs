//! Sensor calibration.
//!
//! ```text
//!        calibrate()            first report
//! Idle ───────────▶ Requested ───────────▶ InProgress ──┬──▶ Completed
//!  ▲                   │                      │   ▲       ├──▶ Failed
//!  │                   └── start rejected ──▶ │   └─step  └──▶ Cancelled
//!  └─────────── any terminal state accepts a new calibrate() ─────┘
//! ```
//!
//! Only one calibration runs at a time. Progress percent never goes backwards unless the
//! vehicle flags a restart.

use aero_link::{ConcurrencyError, Fanout, LinkError, LinkSession, LinkState, PendingMap, WaitError};
use aero_proto::{CalibrationReport, Message};
use mavlink::common::MavCmd;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commands::CommandDispatcher;
use crate::error::{PreconditionError, ProtocolError, VehicleError};
use crate::events::VehicleEvent;

/// ArduPilot extension, not in the common dialect.
const MAV_CMD_ACCELCAL_VEHICLE_POS: u16 = 42429;

/// Positions the accelerometer calibration walks through, in order.
/// Silence tolerated in a step the vehicle runs on its own.
pub const SAMPLING_STEP_WINDOW: Duration = Duration::from_secs(15);

/// Silence tolerated in a step waiting for the operator to move the vehicle.
pub const OPERATOR_STEP_WINDOW: Duration = Duration::from_secs(60);

pub const ACCEL_POSITIONS: [&str; 6] = ["level", "on its left side", "on its right side", "nose down", "nose up", "on its back"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationKind {
    Gyroscope,
    Accelerometer,
    Magnetometer,
    Barometer,
    Level,
}

impl CalibrationKind {
    pub const ALL: [CalibrationKind; 5] = [
        CalibrationKind::Gyroscope,
        CalibrationKind::Accelerometer,
        CalibrationKind::Magnetometer,
        CalibrationKind::Barometer,
        CalibrationKind::Level,
    ];

    /// Value of the `kind` field in calibration progress reports.
    pub fn wire_id(self) -> u8 {
        match self {
            CalibrationKind::Gyroscope => 1,
            CalibrationKind::Accelerometer => 2,
            CalibrationKind::Magnetometer => 3,
            CalibrationKind::Barometer => 4,
            CalibrationKind::Level => 5,
        }
    }

    pub fn from_wire(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.wire_id() == id)
    }

    /// `MAV_CMD_PREFLIGHT_CALIBRATION` parameters that start this calibration.
    pub fn start_params(self) -> [f32; 7] {
        let mut p = [0.0; 7];
        match self {
            CalibrationKind::Gyroscope => p[0] = 1.0,
            CalibrationKind::Magnetometer => p[1] = 1.0,
            CalibrationKind::Barometer => p[2] = 1.0,
            CalibrationKind::Accelerometer => p[4] = 1.0,
            CalibrationKind::Level => p[4] = 2.0,
        }
        p
    }

    /// Whether every step of this calibration needs the operator moving the vehicle.
    /// Accelerometer steps only wait on the operator until the position is confirmed.
    fn operator_driven(self) -> bool {
        self == CalibrationKind::Magnetometer
    }
}

impl fmt::Display for CalibrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CalibrationKind::Gyroscope => "gyroscope",
            CalibrationKind::Accelerometer => "accelerometer",
            CalibrationKind::Magnetometer => "magnetometer",
            CalibrationKind::Barometer => "barometer",
            CalibrationKind::Level => "level",
        })
    }
}

impl std::str::FromStr for CalibrationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gyro" | "gyroscope" => Ok(CalibrationKind::Gyroscope),
            "accel" | "accelerometer" => Ok(CalibrationKind::Accelerometer),
            "mag" | "compass" | "magnetometer" => Ok(CalibrationKind::Magnetometer),
            "baro" | "barometer" => Ok(CalibrationKind::Barometer),
            "level" => Ok(CalibrationKind::Level),
            other => Err(format!("unknown calibration kind `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationProgress {
    pub kind: CalibrationKind,
    pub percent: u8,
    pub current_step: u8,
    pub is_complete: bool,
}

impl CalibrationProgress {
    /// Operator instruction for the current accelerometer step.
    pub fn position_label(&self) -> Option<&'static str> {
        match self.kind {
            CalibrationKind::Accelerometer => ACCEL_POSITIONS.get(usize::from(self.current_step)).copied(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Idle,
    Requested(CalibrationKind),
    InProgress { kind: CalibrationKind, step: u8 },
    Completed(CalibrationKind),
    Failed(CalibrationKind),
    Cancelled(CalibrationKind),
}

impl CalibrationState {
    pub fn active_kind(self) -> Option<CalibrationKind> {
        match self {
            CalibrationState::Requested(k) | CalibrationState::InProgress { kind: k, .. } => Some(k),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalibrationOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Overrides [`SAMPLING_STEP_WINDOW`].
    pub step_window_ms: Option<u64>,
    /// Overrides [`OPERATOR_STEP_WINDOW`].
    pub operator_window_ms: Option<u64>,
}

struct Run {
    percent: u8,
    step: u8,
    reported: bool,
    /// The current step is waiting on the operator; selects the longer window.
    awaiting_operator: bool,
    /// Restarted on every accepted report and on position confirmation.
    last_progress: Instant,
}

impl Run {
    fn new(kind: CalibrationKind) -> Self {
        Self { percent: 0, step: 0, reported: false, awaiting_operator: kind.operator_driven(), last_progress: Instant::now() }
    }
}

struct Machine {
    state: CalibrationState,
    run: Option<Run>,
}

pub struct CalibrationStateMachine {
    session: LinkSession,
    commands: Arc<CommandDispatcher>,
    config: CalibrationConfig,
    events: Fanout<VehicleEvent>,
    machine: Mutex<Machine>,
    outcomes: PendingMap<CalibrationKind, CalibrationOutcome>,
    /// Wakes `calibrate` when the current step's window changes.
    rearm: Notify,
}

impl CalibrationStateMachine {
    pub fn new(
        session: LinkSession,
        commands: Arc<CommandDispatcher>,
        config: CalibrationConfig,
        events: Fanout<VehicleEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            commands,
            config,
            events,
            machine: Mutex::new(Machine { state: CalibrationState::Idle, run: None }),
            outcomes: PendingMap::new(),
            rearm: Notify::new(),
        })
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mut frames = self.session.subscribe();
        let mut states = self.session.subscribe_state();
        let sm = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = frames.recv() => match msg {
                        Some(msg) => {
                            if let Message::CalibrationProgress(report) = &*msg {
                                sm.handle_report(report);
                            }
                        }
                        None => break,
                    },
                    state = states.recv() => match state {
                        Some(LinkState::Lost | LinkState::Disconnected) => sm.abort("link lost"),
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        })
    }

    pub fn state(&self) -> CalibrationState {
        self.machine.lock().unwrap().state
    }

    pub fn is_active(&self) -> bool {
        self.state().active_kind().is_some()
    }

    /// Window for a step, depending on whether it waits on the operator.
    pub fn step_window(&self, awaiting_operator: bool) -> Duration {
        if awaiting_operator {
            self.config.operator_window_ms.map_or(OPERATOR_STEP_WINDOW, Duration::from_millis)
        } else {
            self.config.step_window_ms.map_or(SAMPLING_STEP_WINDOW, Duration::from_millis)
        }
    }

    /// Run one calibration to its end. Fails immediately with
    /// [`ConcurrencyError::CalibrationAlreadyInProgress`] while another one is active.
    pub async fn calibrate(&self, kind: CalibrationKind) -> Result<(), VehicleError> {
        let mut outcome = {
            let mut m = self.machine.lock().unwrap();
            if m.state.active_kind().is_some() {
                return Err(ConcurrencyError::CalibrationAlreadyInProgress.into());
            }
            let outcome = self.outcomes.register(kind)?;
            m.state = CalibrationState::Requested(kind);
            m.run = Some(Run::new(kind));
            outcome
        };
        let _guard = RunGuard { sm: self, kind };
        info!("calibration: starting {}", kind);

        if let Err(e) = self.commands.send_command(MavCmd::MAV_CMD_PREFLIGHT_CALIBRATION as u16, kind.start_params()).await {
            self.finish(kind, CalibrationOutcome::Failed(e.to_string()));
            return Err(e);
        }
        {
            let mut m = self.machine.lock().unwrap();
            if m.state == CalibrationState::Requested(kind) {
                let step = m.run.as_ref().map_or(0, |r| r.step);
                m.state = CalibrationState::InProgress { kind, step };
            }
        }

        loop {
            let quiet = {
                let m = self.machine.lock().unwrap();
                m.run.as_ref().map(|r| (r.last_progress.elapsed(), self.step_window(r.awaiting_operator), r.step))
            };
            let remaining = match quiet {
                Some((quiet, window, step)) if quiet >= window => {
                    let reason = format!("no progress in step {} for {} ms", step, window.as_millis());
                    self.finish(kind, CalibrationOutcome::Failed(reason.clone()));
                    return Err(ProtocolError::CalibrationFailed { kind: kind.to_string(), reason }.into());
                }
                Some((quiet, window, _)) => window - quiet,
                // Already terminal: the outcome is waiting in the slot.
                None => Duration::from_millis(10),
            };
            let waited = tokio::select! {
                r = outcome.wait(remaining) => r,
                _ = self.rearm.notified() => continue,
            };
            match waited {
                Ok(CalibrationOutcome::Completed) => return Ok(()),
                Ok(CalibrationOutcome::Failed(reason)) => {
                    return Err(ProtocolError::CalibrationFailed { kind: kind.to_string(), reason }.into())
                }
                Ok(CalibrationOutcome::Cancelled) => return Err(ProtocolError::CalibrationCancelled { kind: kind.to_string() }.into()),
                Err(WaitError::Timeout) => {}
                Err(WaitError::Link(e)) => return Err(e.into()),
            }
        }
    }

    /// Abandon the active calibration and tell the vehicle to stop.
    pub async fn cancel(&self) -> Result<bool, VehicleError> {
        let Some(kind) = self.state().active_kind() else { return Ok(false) };
        if !self.finish(kind, CalibrationOutcome::Cancelled) {
            return Ok(false);
        }
        info!("calibration: {} cancelled", kind);
        self.commands
            .send_unacknowledged(MavCmd::MAV_CMD_PREFLIGHT_CALIBRATION as u16, [0.0; 7])
            .await?;
        Ok(true)
    }

    /// Tell the vehicle it is now in the position the current accelerometer step asked for.
    pub async fn confirm_vehicle_position(&self) -> Result<(), VehicleError> {
        let step = match self.state() {
            CalibrationState::InProgress { kind: CalibrationKind::Accelerometer, step } => step,
            _ => return Err(PreconditionError::NoPositionRequested.into()),
        };
        debug!("calibration: position {} confirmed", step);
        // ACCELCAL_VEHICLE_POS values start at 1 for level.
        let params = [f32::from(step) + 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        self.commands.send_command(MAV_CMD_ACCELCAL_VEHICLE_POS, params).await?;

        // The vehicle samples this position on its own now.
        if let Some(run) = self.machine.lock().unwrap().run.as_mut() {
            run.awaiting_operator = false;
            run.last_progress = Instant::now();
        }
        self.rearm.notify_one();
        Ok(())
    }

    fn handle_report(&self, report: &CalibrationReport) {
        let Some(kind) = CalibrationKind::from_wire(report.kind) else {
            debug!("calibration: report for unknown kind {}", report.kind);
            return;
        };

        let (progress, outcome) = {
            let mut guard = self.machine.lock().unwrap();
            let m = &mut *guard;
            if m.state.active_kind() != Some(kind) {
                debug!("calibration: ignoring {} report, not running", kind);
                return;
            }
            let Some(run) = m.run.as_mut() else { return };

            let terminal = report.is_complete() || report.is_failed();
            if report.is_restart() {
                info!("calibration: vehicle restarted {}", kind);
            } else if report.percent < run.percent && !terminal {
                debug!("calibration: ignoring regression {} -> {}", run.percent, report.percent);
                return;
            }
            let new_step = !run.reported || report.is_restart() || report.step != run.step;
            if new_step && kind == CalibrationKind::Accelerometer {
                // Each accelerometer step opens with a request to reposition the vehicle.
                run.awaiting_operator = true;
            }
            run.percent = if report.is_complete() { 100 } else { report.percent.min(100) };
            run.step = report.step;
            run.reported = true;
            run.last_progress = Instant::now();

            let progress = CalibrationProgress {
                kind,
                percent: run.percent,
                current_step: run.step,
                is_complete: report.is_complete(),
            };
            let outcome = if report.is_failed() {
                Some(CalibrationOutcome::Failed("vehicle reported failure".into()))
            } else if report.is_complete() {
                Some(CalibrationOutcome::Completed)
            } else {
                m.state = CalibrationState::InProgress { kind, step: run.step };
                None
            };
            (progress, outcome)
        };

        self.events.publish(VehicleEvent::CalibrationProgress(progress));
        if let Some(outcome) = outcome {
            self.finish(kind, outcome);
        }
    }

    /// Move the active `kind` run to its terminal state. Returns false if it was not active.
    fn finish(&self, kind: CalibrationKind, outcome: CalibrationOutcome) -> bool {
        self.terminate(kind, outcome, None)
    }

    /// As [`finish`](Self::finish), but a waiting `calibrate` sees `link_err` instead of the outcome.
    fn terminate(&self, kind: CalibrationKind, outcome: CalibrationOutcome, link_err: Option<LinkError>) -> bool {
        {
            let mut m = self.machine.lock().unwrap();
            if m.state.active_kind() != Some(kind) {
                return false;
            }
            m.state = match outcome {
                CalibrationOutcome::Completed => CalibrationState::Completed(kind),
                CalibrationOutcome::Failed(_) => CalibrationState::Failed(kind),
                CalibrationOutcome::Cancelled => CalibrationState::Cancelled(kind),
            };
            m.run = None;
        }
        match &outcome {
            CalibrationOutcome::Completed => info!("calibration: {} complete", kind),
            CalibrationOutcome::Failed(reason) => warn!("calibration: {} failed: {}", kind, reason),
            CalibrationOutcome::Cancelled => {}
        }
        self.events.publish(VehicleEvent::CalibrationFinished { kind, outcome: outcome.clone() });
        match link_err {
            Some(e) => self.outcomes.fail(&kind, e),
            None => self.outcomes.resolve(&kind, outcome),
        };
        true
    }

    fn abort(&self, reason: &str) {
        let Some(kind) = self.state().active_kind() else { return };
        self.terminate(kind, CalibrationOutcome::Failed(reason.to_string()), Some(LinkError::Disconnected));
    }
}

/// Marks the run cancelled if `calibrate` is dropped while still active.
struct RunGuard<'a> {
    sm: &'a CalibrationStateMachine,
    kind: CalibrationKind,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.sm.finish(self.kind, CalibrationOutcome::Cancelled);
    }
}
