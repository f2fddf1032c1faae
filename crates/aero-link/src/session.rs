//! Link session: one transport, one read loop, one writer, one state machine.
//!
//! ```text
//!            connect()                     frames / heartbeat ok
//! Disconnected ──────▶ Connecting ──────▶ Connected ◀──────────┐
//!      ▲                   │                  │                 │ reopen ok
//!      │   open failed     │                  │ silence, I/O    │
//!      └───────────────────┘                  ▼ error, bad frames
//!      ◀──────────── disconnect() ─────────  Lost ── backoff ───┘
//! ```

use aero_proto::{FrameDecoder, FrameError, Heartbeat, Message};
use bytes::Bytes;
use mavlink::common::{MavAutopilot, MavState, MavType};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{LinkError, TransportError};
use crate::fanout::{Fanout, Subscription};
use crate::settings::{ConnectionSettings, LinkConfig};
use crate::state::{LinkState, LinkStats};
use crate::transport::{self, Transport, TransportIo, TransportReader, TransportWriter};

/// Cheap, cloneable handle. All clones share one session.
#[derive(Clone)]
pub struct LinkSession {
    shared: Arc<Shared>,
}

struct Shared {
    config: LinkConfig,
    state_tx: watch::Sender<LinkState>,
    transitions: Fanout<LinkState>,
    frames: Fanout<Arc<Message>>,
    stats: Mutex<LinkStats>,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    supervisor: tokio::sync::Mutex<Option<Supervisor>>,
}

/// Present from the start of `connect` until `disconnect`. `handle` is set once the
/// transport is open and the supervisor task runs.
struct Supervisor {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

struct Outbound {
    bytes: Bytes,
    done: oneshot::Sender<Result<(), TransportError>>,
}

enum IoEvent {
    Failed(TransportError),
    TooManyFrameErrors(u32),
}

/// Reader and writer tasks of one opened transport.
struct IoTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    events: mpsc::UnboundedReceiver<IoEvent>,
}

impl IoTasks {
    fn stop(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl LinkSession {
    pub fn new(config: LinkConfig) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                state_tx,
                transitions: Fanout::new(),
                frames: Fanout::new(),
                stats: Mutex::new(LinkStats::default()),
                outbound: Mutex::new(None),
                supervisor: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Latest-value view of the state, for UIs.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state_tx.subscribe()
    }

    /// Every transition, in order, without coalescing.
    pub fn subscribe_state(&self) -> Subscription<LinkState> {
        self.shared.transitions.subscribe()
    }

    /// Every decoded frame, in arrival order.
    pub fn subscribe(&self) -> Subscription<Arc<Message>> {
        self.shared.frames.subscribe()
    }

    pub fn stats(&self) -> LinkStats {
        self.shared.stats.lock().unwrap().clone()
    }

    pub async fn connect(&self, settings: &ConnectionSettings) -> Result<(), LinkError> {
        self.connect_with(transport::from_settings(settings)).await
    }

    /// Open `transport` and start the read loop, writer and supervisor. The transport is
    /// kept for reconnect attempts after link loss. A `disconnect()` while the transport is
    /// still opening abandons the attempt and this returns [`LinkError::Disconnected`].
    pub async fn connect_with(&self, transport: Arc<dyn Transport>) -> Result<(), LinkError> {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        {
            let mut sup = self.shared.supervisor.lock().await;
            if sup.is_some() || self.state() != LinkState::Disconnected {
                return Err(LinkError::AlreadyActive);
            }
            *sup = Some(Supervisor { shutdown, handle: None });
            self.shared.transition(LinkState::Connecting);
        }

        info!("link: connecting to {}", transport.endpoint());
        let opened = tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("link: connect to {} cancelled", transport.endpoint());
                return Err(LinkError::Disconnected);
            }
            r = transport.open() => r,
        };

        let mut sup = self.shared.supervisor.lock().await;
        // Only `disconnect()` raises the flag, and it takes the slot when it does.
        let cancelled = *shutdown_rx.borrow();
        let io = match opened {
            Ok(mut io) if cancelled => {
                drop(sup);
                io.writer.close().await;
                return Err(LinkError::Disconnected);
            }
            Ok(io) => io,
            Err(_) if cancelled => return Err(LinkError::Disconnected),
            Err(e) => {
                warn!("link: open {} failed: {}", transport.endpoint(), e);
                sup.take();
                self.shared.transition(LinkState::Disconnected);
                return Err(e.into());
            }
        };

        *self.shared.stats.lock().unwrap() = LinkStats {
            endpoint: Some(transport.endpoint()),
            last_frame: Some(Instant::now()),
            ..Default::default()
        };
        let tasks = self.shared.start_io(io);
        self.shared.transition(LinkState::Connected);

        let handle = tokio::spawn(supervise(self.shared.clone(), transport, tasks, shutdown_rx));
        if let Some(s) = sup.as_mut() {
            s.handle = Some(handle);
        }
        Ok(())
    }

    /// Stop everything and return to Disconnected. Safe to call in any state, including
    /// while a connect is still opening its transport.
    pub async fn disconnect(&self) {
        let mut sup = self.shared.supervisor.lock().await;
        if let Some(s) = sup.take() {
            let _ = s.shutdown.send(true);
            if let Some(handle) = s.handle {
                let _ = handle.await;
            }
        }
        self.shared.clear_outbound();
        if self.state() != LinkState::Disconnected {
            self.shared.transition(LinkState::Disconnected);
            info!("link: disconnected");
        }
    }

    /// Queue `msg` behind every earlier send and wait until it has been written.
    pub async fn send(&self, msg: &Message) -> Result<(), LinkError> {
        if self.state() != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }
        let bytes = msg.encode()?;
        let tx = self.shared.outbound.lock().unwrap().clone().ok_or(LinkError::NotConnected)?;

        let (done, written) = oneshot::channel();
        tx.send(Outbound { bytes, done }).await.map_err(|_| LinkError::NotConnected)?;
        match written.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LinkError::Transport(e)),
            Err(_) => Err(LinkError::Disconnected),
        }
    }
}

impl Shared {
    fn transition(&self, next: LinkState) -> bool {
        let mut from = next;
        let changed = self.state_tx.send_if_modified(|cur| {
            from = *cur;
            if cur.can_transition_to(next) {
                *cur = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("link: {:?} -> {:?}", from, next);
            self.transitions.publish(next);
        } else if from != next {
            warn!("link: ignoring transition {:?} -> {:?}", from, next);
        }
        changed
    }

    fn start_io(self: &Arc<Self>, io: TransportIo) -> IoTasks {
        let (out_tx, out_rx) = mpsc::channel(self.config.outbound_queue.max(1));
        let (ev_tx, events) = mpsc::unbounded_channel();
        *self.outbound.lock().unwrap() = Some(out_tx);

        let reader = tokio::spawn(read_loop(self.clone(), io.reader, ev_tx.clone()));
        let writer = tokio::spawn(write_loop(self.clone(), io.writer, out_rx, ev_tx));
        IoTasks { reader, writer, events }
    }

    fn clear_outbound(&self) {
        self.outbound.lock().unwrap().take();
    }

    fn on_frame(&self, msg: Message) {
        {
            let mut st = self.stats.lock().unwrap();
            st.frames_received += 1;
            st.consecutive_frame_errors = 0;
            st.last_frame = Some(Instant::now());
        }
        self.frames.publish(Arc::new(msg));
    }

    /// Returns the consecutive error count.
    fn on_frame_error(&self, err: &FrameError, discarded: u64) -> u32 {
        let mut st = self.stats.lock().unwrap();
        st.frame_errors += 1;
        st.consecutive_frame_errors += 1;
        st.bytes_discarded = discarded;
        debug!("link: dropped frame: {} ({} consecutive)", err, st.consecutive_frame_errors);
        st.consecutive_frame_errors
    }

    fn silence(&self) -> Duration {
        self.stats.lock().unwrap().last_frame_age().unwrap_or(Duration::ZERO)
    }

    fn enqueue_heartbeat(&self) {
        let Some(tx) = self.outbound.lock().unwrap().clone() else { return };
        let hb = Message::Heartbeat(Heartbeat {
            custom_mode: 0,
            vehicle_type: MavType::MAV_TYPE_GCS as u8,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID as u8,
            base_mode: 0,
            system_status: MavState::MAV_STATE_ACTIVE as u8,
        });
        let Ok(bytes) = hb.encode() else { return };
        let (done, _) = oneshot::channel();
        if tx.try_send(Outbound { bytes, done }).is_err() {
            debug!("link: outbound queue full, skipping heartbeat");
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: TransportReader, events: mpsc::UnboundedSender<IoEvent>) {
    let mut buf = vec![0u8; shared.config.read_buffer_bytes.max(64)];
    let mut decoder = FrameDecoder::new();
    let limit = shared.config.max_consecutive_frame_errors.max(1);

    loop {
        let n = match reader.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                let _ = events.send(IoEvent::Failed(e));
                return;
            }
        };
        decoder.push(&buf[..n]);
        while let Some(decoded) = decoder.next_frame() {
            match decoded.and_then(|f| Message::from_frame(&f)) {
                Ok(msg) => shared.on_frame(msg),
                Err(e) => {
                    let consecutive = shared.on_frame_error(&e, decoder.stats().bytes_discarded);
                    if consecutive >= limit {
                        let _ = events.send(IoEvent::TooManyFrameErrors(consecutive));
                        return;
                    }
                }
            }
        }
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut writer: TransportWriter,
    mut queue: mpsc::Receiver<Outbound>,
    events: mpsc::UnboundedSender<IoEvent>,
) {
    while let Some(out) = queue.recv().await {
        let res = writer.send(&out.bytes).await;
        let failed = match &res {
            Ok(()) => {
                shared.stats.lock().unwrap().frames_sent += 1;
                false
            }
            Err(e) => {
                let _ = events.send(IoEvent::Failed(e.clone()));
                true
            }
        };
        let _ = out.done.send(res);
        if failed {
            break;
        }
    }
    writer.close().await;
}

async fn supervise(
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    mut tasks: IoTasks,
    mut shutdown: watch::Receiver<bool>,
) {
    let hb_timeout = shared.config.heartbeat_timeout();
    let mut watchdog = tokio::time::interval((hb_timeout / 4).clamp(Duration::from_millis(10), Duration::from_millis(250)));
    let hb_every = shared.config.heartbeat_interval();
    let mut hb_tick = tokio::time::interval(hb_every.unwrap_or(Duration::from_secs(1)));

    loop {
        let reason = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tasks.stop();
                    return;
                }
                ev = tasks.events.recv() => break match ev {
                    Some(IoEvent::Failed(e)) => format!("transport: {}", e),
                    Some(IoEvent::TooManyFrameErrors(n)) => format!("{} consecutive bad frames", n),
                    None => "i/o tasks ended".to_string(),
                },
                _ = watchdog.tick() => {
                    let silent = shared.silence();
                    if silent >= hb_timeout {
                        break format!("no frames for {} ms", silent.as_millis());
                    }
                }
                _ = hb_tick.tick(), if hb_every.is_some() => shared.enqueue_heartbeat(),
            }
        };

        warn!("link lost: {}", reason);
        tasks.stop();
        shared.clear_outbound();
        shared.transition(LinkState::Lost);

        let mut delay = shared.config.reconnect_initial();
        tasks = loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            shared.stats.lock().unwrap().reconnect_attempts += 1;
            let opened = tokio::select! {
                _ = shutdown.changed() => return,
                r = transport.open() => r,
            };
            match opened {
                Ok(io) => {
                    {
                        let mut st = shared.stats.lock().unwrap();
                        st.consecutive_frame_errors = 0;
                        st.last_frame = Some(Instant::now());
                    }
                    let tasks = shared.start_io(io);
                    shared.transition(LinkState::Connected);
                    info!("link: reconnected to {}", transport.endpoint());
                    break tasks;
                }
                Err(e) => {
                    debug!("link: reconnect to {} failed: {} (next in {:?})", transport.endpoint(), e, delay);
                    delay = (delay * 2).min(shared.config.reconnect_max());
                }
            }
        };
        watchdog.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use aero_proto::{CommandAck, FrameDecoder, ParamValue, Target};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn quiet_config() -> LinkConfig {
        LinkConfig { send_heartbeat_hz: 0.0, ..Default::default() }
    }

    async fn next_state(sub: &mut Subscription<LinkState>) -> LinkState {
        tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.unwrap().unwrap()
    }

    async fn read_message(dev: &mut DuplexStream, dec: &mut FrameDecoder) -> Message {
        loop {
            if let Some(f) = dec.next_frame() {
                return Message::from_frame(&f.unwrap()).unwrap();
            }
            let mut buf = [0u8; 256];
            let n = tokio::time::timeout(Duration::from_secs(2), dev.read(&mut buf)).await.unwrap().unwrap();
            dec.push(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let session = LinkSession::new(quiet_config());
        let msg = Message::ParamRequestList { target: Target::default() };
        assert_eq!(session.send(&msg).await, Err(LinkError::NotConnected));
    }

    #[tokio::test]
    async fn test_open_failure_returns_to_disconnected() {
        let session = LinkSession::new(quiet_config());
        let mut states = session.subscribe_state();
        let t = Arc::new(MemoryTransport::new("nothing"));
        let err = session.connect_with(t).await.unwrap_err();
        assert!(matches!(err, LinkError::Transport(TransportError::PortUnavailable { .. })));
        assert_eq!(next_state(&mut states).await, LinkState::Connecting);
        assert_eq!(next_state(&mut states).await, LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_frames_fan_out_and_bad_frame_counted() {
        let session = LinkSession::new(quiet_config());
        let t = Arc::new(MemoryTransport::new("fc"));
        let mut dev = t.add_connection();
        session.connect_with(t).await.unwrap();
        let mut a = session.subscribe();
        let mut b = session.subscribe();

        let good = Message::CommandAck(CommandAck { command: 400, result: 0 }).encode().unwrap();
        let mut bad = good.to_vec();
        bad[3] ^= 0x55;
        dev.write_all(&good).await.unwrap();
        dev.write_all(&bad).await.unwrap();
        dev.write_all(&good).await.unwrap();

        for sub in [&mut a, &mut b] {
            for _ in 0..2 {
                let m = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.unwrap().unwrap();
                assert!(matches!(*m, Message::CommandAck(CommandAck { command: 400, .. })));
            }
        }
        let stats = session.stats();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.frame_errors, 1);
        assert_eq!(session.state(), LinkState::Connected);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_sends_are_fifo() {
        let session = LinkSession::new(quiet_config());
        let t = Arc::new(MemoryTransport::new("fc"));
        let mut dev = t.add_connection();
        session.connect_with(t).await.unwrap();

        for i in 0..10u16 {
            let msg = Message::ParamRequestRead { target: Target::default(), index: i as i16, name: String::new() };
            session.send(&msg).await.unwrap();
        }
        let mut dec = FrameDecoder::new();
        for i in 0..10i16 {
            match read_message(&mut dev, &mut dec).await {
                Message::ParamRequestRead { index, .. } => assert_eq!(index, i),
                other => panic!("unexpected {:?}", other),
            }
        }
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_silence_goes_lost_then_reconnects() {
        let cfg = LinkConfig {
            heartbeat_timeout_ms: 100,
            reconnect_initial_ms: 20,
            reconnect_max_ms: 40,
            send_heartbeat_hz: 0.0,
            ..Default::default()
        };
        let session = LinkSession::new(cfg);
        let t = Arc::new(MemoryTransport::new("fc"));
        let _dev1 = t.add_connection();
        let mut states = session.subscribe_state();
        session.connect_with(t.clone()).await.unwrap();
        assert_eq!(next_state(&mut states).await, LinkState::Connecting);
        assert_eq!(next_state(&mut states).await, LinkState::Connected);

        assert_eq!(next_state(&mut states).await, LinkState::Lost);
        let mut dev2 = t.add_connection();
        assert_eq!(next_state(&mut states).await, LinkState::Connected);
        assert!(session.stats().reconnect_attempts >= 1);

        let pv = Message::ParamValue(ParamValue { name: "A".into(), value: 1.0, index: 0, count: 1 });
        let mut frames = session.subscribe();
        dev2.write_all(&pv.encode().unwrap()).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), frames.recv()).await.unwrap().unwrap();
        assert_eq!(*got, pv);

        session.disconnect().await;
        assert_eq!(session.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_repeated_bad_frames_force_lost() {
        let cfg = LinkConfig { max_consecutive_frame_errors: 3, reconnect_initial_ms: 5_000, send_heartbeat_hz: 0.0, ..Default::default() };
        let session = LinkSession::new(cfg);
        let t = Arc::new(MemoryTransport::new("fc"));
        let mut dev = t.add_connection();
        session.connect_with(t).await.unwrap();
        let mut states = session.subscribe_state();

        let mut bad = Message::CommandAck(CommandAck { command: 1, result: 0 }).encode().unwrap().to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        for _ in 0..3 {
            dev.write_all(&bad).await.unwrap();
        }
        assert_eq!(next_state(&mut states).await, LinkState::Lost);
        session.disconnect().await;
        assert_eq!(session.state(), LinkState::Disconnected);
    }

    /// Never finishes opening, like a TCP connect to a host that drops SYNs.
    struct Stalled;

    #[async_trait::async_trait]
    impl Transport for Stalled {
        fn kind(&self) -> &'static str {
            "stalled"
        }

        fn endpoint(&self) -> String {
            "stalled:0".into()
        }

        async fn open(&self) -> Result<TransportIo, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_connect() {
        let session = LinkSession::new(quiet_config());
        let mut states = session.subscribe_state();
        let connecting = tokio::spawn({
            let session = session.clone();
            async move { session.connect_with(Arc::new(Stalled)).await }
        });
        assert_eq!(next_state(&mut states).await, LinkState::Connecting);

        tokio::time::timeout(Duration::from_secs(1), session.disconnect()).await.unwrap();
        assert_eq!(next_state(&mut states).await, LinkState::Disconnected);
        assert_eq!(connecting.await.unwrap(), Err(LinkError::Disconnected));

        // The slot is free again.
        let t = Arc::new(MemoryTransport::new("fc"));
        let _dev = t.add_connection();
        session.connect_with(t).await.unwrap();
        assert_eq!(session.state(), LinkState::Connected);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_twice_rejected_and_disconnect_idempotent() {
        let session = LinkSession::new(quiet_config());
        let t = Arc::new(MemoryTransport::new("fc"));
        let _dev = t.add_connection();
        let _spare = t.add_connection();
        session.connect_with(t.clone()).await.unwrap();
        assert_eq!(session.connect_with(t).await, Err(LinkError::AlreadyActive));
        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), LinkState::Disconnected);
    }
}
