use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where the autopilot is reachable. Immutable for the lifetime of one connection attempt.
///
/// ```toml
/// [connection]
/// type = "serial"
/// port = "/dev/ttyACM0"
/// baud = 115200
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionSettings {
    Serial(SerialSettings),
    Tcp(TcpSettings),
    Udp(UdpSettings),
}

impl ConnectionSettings {
    pub fn endpoint(&self) -> String {
        match self {
            ConnectionSettings::Serial(s) => format!("serial:{}:{}", s.port, s.baud),
            ConnectionSettings::Tcp(t) => format!("tcp:{}:{}", t.host, t.port),
            ConnectionSettings::Udp(u) if u.listen => format!("udpin:0.0.0.0:{}", u.port),
            ConnectionSettings::Udp(u) => format!("udpout:{}:{}", u.host, u.port),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            ConnectionSettings::Serial(s) => {
                if s.port.is_empty() {
                    return Err("serial port missing".into());
                }
                if s.baud == 0 {
                    return Err("serial baud must be > 0".into());
                }
                if !(5..=8).contains(&s.data_bits) {
                    return Err(format!("unsupported data bits {}", s.data_bits));
                }
                if !(1..=2).contains(&s.stop_bits) {
                    return Err(format!("unsupported stop bits {}", s.stop_bits));
                }
                Ok(())
            }
            ConnectionSettings::Tcp(t) => {
                if t.host.is_empty() || t.port == 0 {
                    return Err("tcp host/port missing".into());
                }
                Ok(())
            }
            ConnectionSettings::Udp(u) => {
                if u.port == 0 || (!u.listen && u.host.is_empty()) {
                    return Err("udp host/port missing".into());
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub port: String,
    pub baud: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: ParitySetting,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParitySetting {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpSettings {
    pub host: String,
    pub port: u16,
    /// Defaults to 5000 ms.
    pub connect_timeout_ms: Option<u64>,
}

impl TcpSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(5000))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdpSettings {
    #[serde(default)]
    pub host: String,
    pub port: u16,
    /// Bind `port` locally and learn the autopilot address from the first datagram
    /// (the usual 14550 setup) instead of sending to `host:port`.
    #[serde(default)]
    pub listen: bool,
    /// How long a listening socket waits for that first datagram. Defaults to 5000 ms.
    pub first_packet_timeout_ms: Option<u64>,
}

impl UdpSettings {
    pub fn first_packet_timeout(&self) -> Duration {
        Duration::from_millis(self.first_packet_timeout_ms.unwrap_or(5000))
    }
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

/// Session tuning. Every field has a default so the `[link]` section may be omitted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Silence (no valid frame) tolerated while Connected before declaring the link Lost.
    pub heartbeat_timeout_ms: u64,

    /// Consecutive checksum/length failures that force Lost.
    pub max_consecutive_frame_errors: u32,

    /// First reconnect delay; doubles per failed attempt.
    pub reconnect_initial_ms: u64,

    /// Reconnect delay cap.
    pub reconnect_max_ms: u64,

    /// Ground-station heartbeat rate. 0 disables it.
    pub send_heartbeat_hz: f32,

    pub read_buffer_bytes: usize,

    pub outbound_queue: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 3000,
            max_consecutive_frame_errors: 20,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 8000,
            send_heartbeat_hz: 1.0,
            read_buffer_bytes: 4096,
            outbound_queue: 64,
        }
    }
}

impl LinkConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms.max(1))
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms.max(1))
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms).max(1))
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.send_heartbeat_hz > 0.0)
            .then(|| Duration::from_secs_f32(1.0 / self.send_heartbeat_hz.max(0.1)))
    }
}
