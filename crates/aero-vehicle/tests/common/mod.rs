#![allow(dead_code)]

use aero_link::transport::MemoryTransport;
use aero_link::{LinkConfig, LinkSession, Subscription};
use aero_proto::{CalibrationReport, CommandAck, CommandLong, FrameDecoder, Heartbeat, Message, ParamValue};
use aero_vehicle::{CalibrationConfig, CommandConfig, ParamSyncConfig, SafetySettings, Vehicle, VehicleConfig, VehicleEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::Instant;

/// The autopilot end of an in-memory link.
pub struct SimAutopilot {
    io: DuplexStream,
    decoder: FrameDecoder,
}

impl SimAutopilot {
    pub async fn send(&mut self, msg: Message) {
        let bytes = msg.encode().unwrap();
        self.io.write_all(&bytes).await.unwrap();
    }

    pub async fn recv(&mut self) -> Message {
        self.try_recv(Duration::from_secs(2)).await.expect("no frame from the ground station")
    }

    pub async fn try_recv(&mut self, wait: Duration) -> Option<Message> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Some(Message::from_frame(&frame.unwrap()).unwrap());
            }
            let mut buf = [0u8; 512];
            match tokio::time::timeout_at(deadline, self.io.read(&mut buf)).await {
                Err(_) | Ok(Ok(0)) => return None,
                Ok(Ok(n)) => self.decoder.push(&buf[..n]),
                Ok(Err(e)) => panic!("sim read failed: {}", e),
            }
        }
    }

    pub async fn expect_command(&mut self) -> CommandLong {
        match self.recv().await {
            Message::CommandLong(c) => c,
            other => panic!("expected COMMAND_LONG, got {:?}", other),
        }
    }

    pub async fn ack(&mut self, command: u16, result: u8) {
        self.send(Message::CommandAck(CommandAck { command, result })).await;
    }

    pub async fn param(&mut self, name: &str, value: f32, index: u16, count: u16) {
        self.send(Message::ParamValue(ParamValue { name: name.into(), value, index, count })).await;
    }

    pub async fn calibration(&mut self, kind: u8, percent: u8, step: u8, flags: u8) {
        self.send(Message::CalibrationProgress(CalibrationReport { kind, percent, step, flags })).await;
    }

    pub async fn heartbeat(&mut self, armed: bool) {
        let base_mode = if armed { Heartbeat::MODE_FLAG_SAFETY_ARMED } else { 0 };
        self.send(Message::Heartbeat(Heartbeat { base_mode, ..Default::default() })).await;
    }
}

pub struct Harness {
    pub vehicle: Vehicle,
    pub sim: SimAutopilot,
    pub transport: Arc<MemoryTransport>,
}

pub fn fast_config() -> VehicleConfig {
    VehicleConfig {
        params: ParamSyncConfig {
            download_attempt_timeout_ms: 100,
            download_retries: 3,
            write_timeout_ms: 100,
            write_retries: 3,
            read_timeout_ms: 100,
            read_retries: 1,
            ..Default::default()
        },
        commands: CommandConfig { ack_timeout_ms: 200, ..Default::default() },
        calibration: CalibrationConfig { step_window_ms: Some(500), operator_window_ms: Some(500) },
        ..Default::default()
    }
}

pub async fn connect(config: VehicleConfig, safety: SafetySettings) -> Harness {
    let transport = Arc::new(MemoryTransport::new("sim"));
    let io = transport.add_connection();
    let session = LinkSession::new(LinkConfig {
        send_heartbeat_hz: 0.0,
        heartbeat_timeout_ms: 30_000,
        reconnect_initial_ms: 50,
        ..Default::default()
    });
    let vehicle = Vehicle::new(session.clone(), config, safety);
    session.connect_with(transport.clone()).await.unwrap();
    Harness { vehicle, sim: SimAutopilot { io, decoder: FrameDecoder::new() }, transport }
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn drain(sub: &mut Subscription<VehicleEvent>) -> Vec<VehicleEvent> {
    std::iter::from_fn(|| sub.try_recv()).collect()
}

pub async fn next_event(sub: &mut Subscription<VehicleEvent>, mut pick: impl FnMut(&VehicleEvent) -> bool) -> VehicleEvent {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let ev = tokio::time::timeout_at(deadline, sub.recv()).await.expect("event not seen in time").unwrap();
        if pick(&ev) {
            return ev;
        }
    }
}
