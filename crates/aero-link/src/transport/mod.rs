//! Physical channels to the autopilot.
//!
//! A [`Transport`] knows how to open one channel; every successful [`Transport::open`]
//! yields a fresh [`TransportIo`] whose halves are owned by the session's read loop and
//! writer task. Reopening after link loss calls `open` again on the same transport.

mod memory;
mod serial;
mod tcp;
mod udp;

pub use memory::MemoryTransport;
pub use serial::{list_serial_ports, SerialPortEntry, SerialTransport};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;
use crate::settings::ConnectionSettings;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short transport name ("serial", "tcp", ...).
    fn kind(&self) -> &'static str;

    /// Human readable endpoint, used in logs and stats.
    fn endpoint(&self) -> String;

    async fn open(&self) -> Result<TransportIo, TransportError>;
}

/// Build the transport described by `settings`.
pub fn from_settings(settings: &ConnectionSettings) -> Arc<dyn Transport> {
    match settings {
        ConnectionSettings::Serial(s) => Arc::new(SerialTransport::new(s.clone())),
        ConnectionSettings::Tcp(t) => Arc::new(TcpTransport::new(t.clone())),
        ConnectionSettings::Udp(u) => Arc::new(UdpTransport::new(u.clone())),
    }
}

/// An opened channel, split so reads and writes can proceed concurrently.
pub struct TransportIo {
    pub reader: TransportReader,
    pub writer: TransportWriter,
}

impl TransportIo {
    pub fn new(endpoint: impl Into<String>, reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader: TransportReader { inner: reader },
            writer: TransportWriter { inner: Some(writer), endpoint: endpoint.into() },
        }
    }
}

pub struct TransportReader {
    inner: BoxedReader,
}

impl TransportReader {
    /// Suspends until at least one byte is available. End of stream is reported as
    /// [`TransportError::Closed`].
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.inner.read(buf).await {
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => Ok(n),
            Err(e) => Err(TransportError::ReadFailed(e.to_string())),
        }
    }
}

pub struct TransportWriter {
    inner: Option<BoxedWriter>,
    endpoint: String,
}

impl TransportWriter {
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let w = self.inner.as_mut().ok_or(TransportError::Closed)?;
        w.write_all(bytes)
            .await
            .map_err(|e| TransportError::WriteFailed(format!("{}: {}", self.endpoint, e)))?;
        w.flush()
            .await
            .map_err(|e| TransportError::WriteFailed(format!("{}: {}", self.endpoint, e)))
    }

    /// Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut w) = self.inner.take() {
            let _ = w.shutdown().await;
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }
}
