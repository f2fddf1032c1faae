use aero_link::{Fanout, LinkError, LinkSession, LinkState, PendingMap, WaitError};
use aero_proto::{CommandLong, Message, Target};
use mavlink::common::{MavCmd, MavResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CommandError, PreconditionError, ValidationError, VehicleError};
use crate::events::{Severity, StatusMessage, VehicleEvent};

/// `param2` of an arm/disarm command that bypasses the autopilot's pre-arm checks.
pub const FORCE_ARM_MAGIC: f32 = 21196.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub ack_timeout_ms: u64,
    pub motor_count: u8,
    /// Refuse to arm until the caller confirmed arming. Taken from [`SafetySettings`](crate::SafetySettings).
    #[serde(skip)]
    pub require_arming_confirmation: bool,
    /// Refuse to arm or spin motors until the caller confirmed props are off.
    #[serde(skip)]
    pub require_propeller_removal_confirmation: bool,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 3000,
            motor_count: 4,
            require_arming_confirmation: true,
            require_propeller_removal_confirmation: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Confirmations {
    pub arming: bool,
    pub propellers_removed: bool,
}

/// Acknowledged `COMMAND_LONG` requests, plus the armed flag tracked from heartbeats.
pub struct CommandDispatcher {
    session: LinkSession,
    target: Target,
    config: CommandConfig,
    events: Fanout<VehicleEvent>,
    confirmations: Mutex<Confirmations>,
    pending: PendingMap<u16, u8>,
    armed: AtomicBool,
}

impl CommandDispatcher {
    pub fn new(session: LinkSession, target: Target, config: CommandConfig, events: Fanout<VehicleEvent>) -> Arc<Self> {
        Arc::new(Self {
            session,
            target,
            config,
            events,
            confirmations: Mutex::new(Confirmations::default()),
            pending: PendingMap::new(),
            armed: AtomicBool::new(false),
        })
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mut frames = self.session.subscribe();
        let mut states = self.session.subscribe_state();
        let dispatcher = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = frames.recv() => match msg {
                        Some(msg) => dispatcher.handle(&msg),
                        None => break,
                    },
                    state = states.recv() => match state {
                        Some(LinkState::Lost | LinkState::Disconnected) => dispatcher.on_link_down(),
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        })
    }

    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    pub fn confirmations(&self) -> Confirmations {
        *self.confirmations.lock().unwrap()
    }

    pub fn confirm_arming(&self, confirmed: bool) {
        self.confirmations.lock().unwrap().arming = confirmed;
    }

    pub fn confirm_propellers_removed(&self, confirmed: bool) {
        self.confirmations.lock().unwrap().propellers_removed = confirmed;
    }

    pub fn clear_confirmations(&self) {
        *self.confirmations.lock().unwrap() = Confirmations::default();
    }

    /// Send `command` and wait for its acknowledgement. `ACCEPTED` and `IN_PROGRESS`
    /// count as success. There is no automatic resend: a lost ack surfaces as
    /// [`CommandError::Timeout`] and the caller decides.
    pub async fn send_command(&self, command: u16, params: [f32; 7]) -> Result<(), VehicleError> {
        let mut pending = self.pending.register(command)?;
        let msg = Message::CommandLong(CommandLong { target: self.target, command, confirmation: 0, params });
        self.session.send(&msg).await?;

        match pending.wait(Duration::from_millis(self.config.ack_timeout_ms)).await {
            Ok(result) if result == MavResult::MAV_RESULT_ACCEPTED as u8 || result == MavResult::MAV_RESULT_IN_PROGRESS as u8 => {
                debug!("cmd {}: ack {}", command, result);
                Ok(())
            }
            Ok(result) => {
                warn!("cmd {}: rejected with {}", command, result);
                Err(CommandError::Rejected { command, result }.into())
            }
            Err(WaitError::Timeout) => {
                warn!("cmd {}: no ack", command);
                Err(CommandError::Timeout { command }.into())
            }
            Err(WaitError::Link(e)) => Err(e.into()),
        }
    }

    /// Send `command` without waiting for (or claiming) its acknowledgement.
    pub async fn send_unacknowledged(&self, command: u16, params: [f32; 7]) -> Result<(), VehicleError> {
        let msg = Message::CommandLong(CommandLong { target: self.target, command, confirmation: 0, params });
        Ok(self.session.send(&msg).await?)
    }

    pub async fn arm(&self, force: bool) -> Result<(), VehicleError> {
        let c = self.confirmations();
        if self.config.require_arming_confirmation && !c.arming {
            return Err(PreconditionError::ArmingNotConfirmed.into());
        }
        if self.config.require_propeller_removal_confirmation && !c.propellers_removed {
            return Err(PreconditionError::PropellerRemovalNotConfirmed.into());
        }
        info!("cmd: arm{}", if force { " (forced)" } else { "" });
        self.send_command(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM as u16, arm_params(true, force)).await?;
        self.set_armed(true);
        Ok(())
    }

    pub async fn disarm(&self, force: bool) -> Result<(), VehicleError> {
        info!("cmd: disarm{}", if force { " (forced)" } else { "" });
        self.send_command(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM as u16, arm_params(false, force)).await?;
        self.set_armed(false);
        Ok(())
    }

    pub async fn reboot(&self) -> Result<(), VehicleError> {
        self.reboot_shutdown(1.0).await
    }

    pub async fn shutdown(&self) -> Result<(), VehicleError> {
        self.reboot_shutdown(2.0).await
    }

    async fn reboot_shutdown(&self, action: f32) -> Result<(), VehicleError> {
        if self.is_armed() {
            return Err(PreconditionError::VehicleArmed.into());
        }
        info!("cmd: {}", if action == 1.0 { "reboot" } else { "shutdown" });
        let params = [action, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        self.send_command(MavCmd::MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN as u16, params).await
    }

    /// Spin one motor (1-based) at `throttle_percent` for `duration`.
    pub async fn motor_test(&self, motor: u8, throttle_percent: f32, duration: Duration) -> Result<(), VehicleError> {
        let count = self.config.motor_count;
        if motor == 0 || motor > count {
            return Err(ValidationError::OutOfRange {
                name: "motor".into(),
                value: f32::from(motor),
                min: 1.0,
                max: f32::from(count),
            }
            .into());
        }
        if !throttle_percent.is_finite() {
            return Err(ValidationError::NotFinite { name: "throttle".into(), value: throttle_percent }.into());
        }
        if !(0.0..=100.0).contains(&throttle_percent) {
            return Err(ValidationError::OutOfRange { name: "throttle".into(), value: throttle_percent, min: 0.0, max: 100.0 }.into());
        }
        if self.config.require_propeller_removal_confirmation && !self.confirmations().propellers_removed {
            return Err(PreconditionError::PropellerRemovalNotConfirmed.into());
        }
        if self.is_armed() {
            return Err(PreconditionError::VehicleArmed.into());
        }
        info!("cmd: motor test #{} at {}% for {:?}", motor, throttle_percent, duration);
        self.send_command(MavCmd::MAV_CMD_DO_MOTOR_TEST as u16, motor_test_params(motor, throttle_percent, duration)).await
    }

    /// Zero-throttle every motor slot without waiting for acks. Keeps going past send
    /// failures and reports the first one.
    pub async fn stop_all_motors(&self) -> Result<(), VehicleError> {
        warn!("cmd: stopping all motors");
        let mut first_err = None;
        for motor in 1..=self.config.motor_count {
            let params = motor_test_params(motor, 0.0, Duration::ZERO);
            if let Err(e) = self.send_unacknowledged(MavCmd::MAV_CMD_DO_MOTOR_TEST as u16, params).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn handle(&self, msg: &Message) {
        match msg {
            Message::CommandAck(ack) => {
                if !self.pending.resolve(&ack.command, ack.result) {
                    debug!("cmd: unsolicited ack for {} ({})", ack.command, ack.result);
                }
            }
            Message::Heartbeat(hb) => self.set_armed(hb.is_armed()),
            Message::StatusText(st) => {
                self.events.publish(VehicleEvent::StatusMessage(StatusMessage {
                    severity: Severity::from_wire(st.severity),
                    text: st.text.clone(),
                    from_vehicle: true,
                }));
            }
            _ => {}
        }
    }

    fn set_armed(&self, armed: bool) {
        if self.armed.swap(armed, Ordering::SeqCst) != armed {
            info!("vehicle {}", if armed { "armed" } else { "disarmed" });
            self.events.publish(VehicleEvent::ArmedChanged { armed });
        }
    }

    fn on_link_down(&self) {
        let n = self.pending.fail_all(LinkError::Disconnected);
        if n > 0 {
            debug!("cmd: failed {} pending commands on link loss", n);
        }
        self.clear_confirmations();
    }
}

fn arm_params(arm: bool, force: bool) -> [f32; 7] {
    let p1 = if arm { 1.0 } else { 0.0 };
    let p2 = if force { FORCE_ARM_MAGIC } else { 0.0 };
    [p1, p2, 0.0, 0.0, 0.0, 0.0, 0.0]
}

/// MOTOR_TEST_THROTTLE_PERCENT = 0.
fn motor_test_params(motor: u8, throttle_percent: f32, duration: Duration) -> [f32; 7] {
    [f32::from(motor), 0.0, throttle_percent, duration.as_secs_f32(), 0.0, 0.0, 0.0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use aero_link::LinkConfig;

    fn dispatcher(config: CommandConfig) -> Arc<CommandDispatcher> {
        CommandDispatcher::new(LinkSession::new(LinkConfig::default()), Target::default(), config, Fanout::new())
    }

    #[test]
    fn test_arm_params() {
        assert_eq!(arm_params(true, false)[..2], [1.0, 0.0]);
        assert_eq!(arm_params(true, true)[..2], [1.0, 21196.0]);
        assert_eq!(arm_params(false, true)[..2], [0.0, 21196.0]);
    }

    #[tokio::test]
    async fn test_arm_needs_both_confirmations() {
        let d = dispatcher(CommandConfig::default());
        assert_eq!(d.arm(false).await, Err(VehicleError::Precondition(PreconditionError::ArmingNotConfirmed)));
        d.confirm_arming(true);
        assert_eq!(d.arm(false).await, Err(VehicleError::Precondition(PreconditionError::PropellerRemovalNotConfirmed)));
        d.confirm_propellers_removed(true);
        // Preconditions pass; the closed link is what fails now.
        assert_eq!(d.arm(false).await, Err(VehicleError::Link(LinkError::NotConnected)));
    }

    #[tokio::test]
    async fn test_motor_test_validation() {
        let d = dispatcher(CommandConfig { require_propeller_removal_confirmation: false, ..Default::default() });
        assert!(matches!(d.motor_test(0, 10.0, Duration::from_secs(1)).await, Err(VehicleError::Validation(_))));
        assert!(matches!(d.motor_test(5, 10.0, Duration::from_secs(1)).await, Err(VehicleError::Validation(_))));
        assert!(matches!(d.motor_test(1, 120.0, Duration::from_secs(1)).await, Err(VehicleError::Validation(_))));
        assert!(matches!(d.motor_test(1, f32::NAN, Duration::from_secs(1)).await, Err(VehicleError::Validation(_))));
    }

    #[tokio::test]
    async fn test_heartbeat_tracks_armed_state() {
        let events = Fanout::new();
        let mut sub = events.subscribe();
        let d = CommandDispatcher::new(LinkSession::new(LinkConfig::default()), Target::default(), CommandConfig::default(), events);
        let hb = aero_proto::Heartbeat { base_mode: aero_proto::Heartbeat::MODE_FLAG_SAFETY_ARMED, ..Default::default() };
        d.handle(&Message::Heartbeat(hb));
        d.handle(&Message::Heartbeat(hb));
        assert!(d.is_armed());
        assert_eq!(sub.try_recv(), Some(VehicleEvent::ArmedChanged { armed: true }));
        assert_eq!(sub.try_recv(), None);
        assert_eq!(d.reboot().await, Err(VehicleError::Precondition(PreconditionError::VehicleArmed)));
    }
}
