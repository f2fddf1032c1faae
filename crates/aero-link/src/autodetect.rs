use aero_proto::{FrameDecoder, Message};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::TransportError;
use crate::settings::{ParitySetting, SerialSettings};
use crate::transport::{list_serial_ports, SerialTransport, Transport};

/// Enumerated ports first, then the usual fixed device names not already listed.
pub fn default_candidate_devs() -> Vec<String> {
    let mut devs: Vec<String> = list_serial_ports()
        .map(|ports| ports.into_iter().map(|p| p.name).collect())
        .unwrap_or_default();
    for fixed in ["/dev/ttyACM0", "/dev/ttyACM1", "/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/serial0", "/dev/ttyAMA0"] {
        if !devs.iter().any(|d| d == fixed) {
            devs.push(fixed.to_string());
        }
    }
    devs
}

pub fn default_candidate_bauds() -> Vec<u32> {
    vec![115200, 57600, 921600, 230400]
}

/// First serial device × baud pair that produces a heartbeat within `heartbeat_timeout`.
/// Every attempt is logged; run with `RUST_LOG=aero_link=debug` to see the misses.
pub async fn autodetect(devs: &[String], bauds: &[u32], heartbeat_timeout: Duration) -> Option<SerialSettings> {
    let candidates = devs.iter().flat_map(|dev| {
        bauds.iter().map(move |&baud| SerialSettings {
            port: dev.clone(),
            baud,
            data_bits: 8,
            parity: ParitySetting::None,
            stop_bits: 1,
        })
    });
    first_responding(candidates.map(|s| (SerialTransport::new(s.clone()), s)), heartbeat_timeout).await
}

async fn first_responding<T: Transport, K>(candidates: impl IntoIterator<Item = (T, K)>, timeout: Duration) -> Option<K> {
    for (transport, key) in candidates {
        match probe(&transport, timeout).await {
            Ok(true) => {
                info!("autodetect: heartbeat on {}", transport.endpoint());
                return Some(key);
            }
            Ok(false) => debug!("autodetect: {} silent", transport.endpoint()),
            Err(e) => debug!("autodetect: {} unavailable: {}", transport.endpoint(), e),
        }
    }
    None
}

/// Open `transport` and listen for a heartbeat frame until `timeout` elapses.
pub async fn probe(transport: &dyn Transport, timeout: Duration) -> Result<bool, TransportError> {
    let mut io = transport.open().await?;
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 512];
    let deadline = tokio::time::Instant::now() + timeout;

    let seen = loop {
        let n = match tokio::time::timeout_at(deadline, io.reader.recv(&mut buf)).await {
            Err(_) => break false,
            Ok(Err(TransportError::Closed)) => break false,
            Ok(Err(e)) => {
                io.writer.close().await;
                return Err(e);
            }
            Ok(Ok(n)) => n,
        };
        decoder.push(&buf[..n]);
        let mut hb = false;
        while let Some(frame) = decoder.next_frame() {
            if let Ok(Message::Heartbeat(_)) = frame.and_then(|f| Message::from_frame(&f)) {
                hb = true;
            }
        }
        if hb {
            break true;
        }
    };
    io.writer.close().await;
    Ok(seen)
}
