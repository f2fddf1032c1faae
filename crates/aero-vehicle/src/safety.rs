use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ValidationError;

/// What the autopilot does when a failsafe trips. Values are the ArduCopter
/// `FS_THR_ENABLE` / `FS_GCS_ENABLE` encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailsafeAction {
    Disabled,
    ReturnToLaunch,
    ContinueMission,
    Land,
    SmartRtlOrRtl,
    SmartRtlOrLand,
    AutoLandOrRtl,
}

impl FailsafeAction {
    pub fn param_value(self) -> f32 {
        match self {
            FailsafeAction::Disabled => 0.0,
            FailsafeAction::ReturnToLaunch => 1.0,
            FailsafeAction::ContinueMission => 2.0,
            FailsafeAction::Land => 3.0,
            FailsafeAction::SmartRtlOrRtl => 4.0,
            FailsafeAction::SmartRtlOrLand => 5.0,
            FailsafeAction::AutoLandOrRtl => 6.0,
        }
    }

    pub fn from_param_value(v: f32) -> Option<Self> {
        Some(match v.round() as i32 {
            0 => FailsafeAction::Disabled,
            1 => FailsafeAction::ReturnToLaunch,
            2 => FailsafeAction::ContinueMission,
            3 => FailsafeAction::Land,
            4 => FailsafeAction::SmartRtlOrRtl,
            5 => FailsafeAction::SmartRtlOrLand,
            6 => FailsafeAction::AutoLandOrRtl,
            _ => return None,
        })
    }
}

/// Operator-facing safety configuration. Written to the vehicle as ordinary parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetySettings {
    pub radio_failsafe: FailsafeAction,
    pub gcs_failsafe: FailsafeAction,
    /// Volts; 0 disables the check.
    pub low_battery_voltage: f32,
    pub critical_battery_voltage: f32,
    pub fence_enabled: bool,
    pub fence_max_altitude_m: f32,
    pub fence_radius_m: f32,
    pub require_arming_confirmation: bool,
    pub require_propeller_removal_confirmation: bool,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            radio_failsafe: FailsafeAction::ReturnToLaunch,
            gcs_failsafe: FailsafeAction::Disabled,
            low_battery_voltage: 10.5,
            critical_battery_voltage: 10.0,
            fence_enabled: false,
            fence_max_altitude_m: 100.0,
            fence_radius_m: 300.0,
            require_arming_confirmation: true,
            require_propeller_removal_confirmation: true,
        }
    }
}

impl SafetySettings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let volts = [("low_battery_voltage", self.low_battery_voltage), ("critical_battery_voltage", self.critical_battery_voltage)];
        for (name, v) in volts {
            if !v.is_finite() {
                return Err(ValidationError::NotFinite { name: name.into(), value: v });
            }
            if !(0.0..=60.0).contains(&v) {
                return Err(ValidationError::OutOfRange { name: name.into(), value: v, min: 0.0, max: 60.0 });
            }
        }
        if self.low_battery_voltage > 0.0
            && self.critical_battery_voltage > 0.0
            && self.critical_battery_voltage >= self.low_battery_voltage
        {
            return Err(ValidationError::Settings(format!(
                "critical battery voltage {} must be below low voltage {}",
                self.critical_battery_voltage, self.low_battery_voltage
            )));
        }
        if !(10.0..=1000.0).contains(&self.fence_max_altitude_m) {
            return Err(ValidationError::OutOfRange {
                name: "fence_max_altitude_m".into(),
                value: self.fence_max_altitude_m,
                min: 10.0,
                max: 1000.0,
            });
        }
        if !(30.0..=10000.0).contains(&self.fence_radius_m) {
            return Err(ValidationError::OutOfRange {
                name: "fence_radius_m".into(),
                value: self.fence_radius_m,
                min: 30.0,
                max: 10000.0,
            });
        }
        Ok(())
    }

    /// Vehicle parameters these settings map to. The confirmation flags stay client-side.
    pub fn to_parameters(&self) -> BTreeMap<String, f32> {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        [
            ("FS_THR_ENABLE", self.radio_failsafe.param_value()),
            ("FS_GCS_ENABLE", self.gcs_failsafe.param_value()),
            ("BATT_LOW_VOLT", self.low_battery_voltage),
            ("BATT_CRT_VOLT", self.critical_battery_voltage),
            ("FENCE_ENABLE", flag(self.fence_enabled)),
            ("FENCE_ALT_MAX", self.fence_max_altitude_m),
            ("FENCE_RADIUS", self.fence_radius_m),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}
