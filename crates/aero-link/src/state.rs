use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Lost,
}

impl LinkState {
    /// Reconnects only start from `Lost`; `Connecting` is reserved for caller-initiated connects.
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Lost)
                | (Connected, Disconnected)
                | (Lost, Connected)
                | (Lost, Disconnected)
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    pub endpoint: Option<String>,
    pub frames_received: u64,
    pub frames_sent: u64,
    /// Checksum and length failures, cumulative for the session.
    pub frame_errors: u64,
    pub consecutive_frame_errors: u32,
    pub bytes_discarded: u64,
    pub reconnect_attempts: u32,
    pub last_frame: Option<Instant>,
}

impl LinkStats {
    pub fn last_frame_age(&self) -> Option<Duration> {
        self.last_frame.map(|t| t.elapsed())
    }
}
