use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::io::DuplexStream;

use super::{Transport, TransportIo};
use crate::error::TransportError;

const PIPE_CAPACITY: usize = 64 * 1024;

/// In-process transport backed by duplex pipes. Each [`add_connection`](Self::add_connection)
/// queues one future `open()` and hands back the autopilot side of the pipe; `open()` with
/// nothing queued behaves like an unplugged port.
pub struct MemoryTransport {
    name: String,
    queued: Mutex<VecDeque<DuplexStream>>,
}

impl MemoryTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), queued: Mutex::new(VecDeque::new()) }
    }

    pub fn add_connection(&self) -> DuplexStream {
        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        self.queued.lock().unwrap().push_back(ours);
        theirs
    }

    pub fn queued(&self) -> usize {
        self.queued.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn endpoint(&self) -> String {
        format!("memory:{}", self.name)
    }

    async fn open(&self) -> Result<TransportIo, TransportError> {
        let stream = self.queued.lock().unwrap().pop_front().ok_or_else(|| TransportError::PortUnavailable {
            port: self.name.clone(),
            reason: "no peer attached".into(),
        })?;
        let (r, w) = tokio::io::split(stream);
        Ok(TransportIo::new(self.endpoint(), Box::new(r), Box::new(w)))
    }
}
