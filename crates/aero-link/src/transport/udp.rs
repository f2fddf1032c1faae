use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use super::{Transport, TransportIo};
use crate::error::TransportError;
use crate::settings::UdpSettings;

/// Datagram transport. Each frame goes out as its own datagram; datagrams may be lost or
/// reordered, which the session tolerates.
pub struct UdpTransport {
    settings: UdpSettings,
}

impl UdpTransport {
    pub fn new(settings: UdpSettings) -> Self {
        Self { settings }
    }

    async fn open_listen(&self) -> Result<(Arc<UdpSocket>, Option<Vec<u8>>), TransportError> {
        let bind = format!("0.0.0.0:{}", self.settings.port);
        let socket = UdpSocket::bind(&bind).await.map_err(|e| TransportError::PortUnavailable {
            port: bind.clone(),
            reason: e.to_string(),
        })?;

        let mut buf = vec![0u8; 2048];
        let (n, peer) = tokio::time::timeout(self.settings.first_packet_timeout(), socket.recv_from(&mut buf))
            .await
            .map_err(|_| TransportError::Timeout { endpoint: self.endpoint() })?
            .map_err(|e| TransportError::PortUnavailable { port: bind.clone(), reason: e.to_string() })?;
        socket.connect(peer).await.map_err(|e| TransportError::HostUnreachable {
            host: peer.to_string(),
            reason: e.to_string(),
        })?;
        info!("udp: autopilot at {}", peer);

        buf.truncate(n);
        Ok((Arc::new(socket), Some(buf)))
    }

    async fn open_client(&self) -> Result<(Arc<UdpSocket>, Option<Vec<u8>>), TransportError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| TransportError::PortUnavailable {
            port: "0.0.0.0:0".into(),
            reason: e.to_string(),
        })?;
        let remote = format!("{}:{}", self.settings.host, self.settings.port);
        socket
            .connect(&remote)
            .await
            .map_err(|e| TransportError::HostUnreachable { host: remote.clone(), reason: e.to_string() })?;
        debug!("udp: sending to {}", remote);
        Ok((Arc::new(socket), None))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> &'static str {
        "udp"
    }

    fn endpoint(&self) -> String {
        if self.settings.listen {
            format!("udpin:0.0.0.0:{}", self.settings.port)
        } else {
            format!("udpout:{}:{}", self.settings.host, self.settings.port)
        }
    }

    async fn open(&self) -> Result<TransportIo, TransportError> {
        let (socket, first) = if self.settings.listen {
            self.open_listen().await?
        } else {
            self.open_client().await?
        };
        let reader = DatagramReader { socket: socket.clone(), first };
        let writer = DatagramWriter { socket };
        Ok(TransportIo::new(self.endpoint(), Box::new(reader), Box::new(writer)))
    }
}

struct DatagramReader {
    socket: Arc<UdpSocket>,
    // Datagram consumed while learning the peer in listen mode.
    first: Option<Vec<u8>>,
}

impl AsyncRead for DatagramReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if let Some(first) = self.first.take() {
            let n = first.len().min(buf.remaining());
            buf.put_slice(&first[..n]);
            return Poll::Ready(Ok(()));
        }
        // An empty datagram must not read as end of stream.
        loop {
            let before = buf.filled().len();
            match self.socket.poll_recv(cx, buf) {
                Poll::Ready(Ok(())) if buf.filled().len() == before => continue,
                other => return other,
            }
        }
    }
}

struct DatagramWriter {
    socket: Arc<UdpSocket>,
}

impl AsyncWrite for DatagramWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listen_learns_peer_and_keeps_first_datagram() {
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let t = UdpTransport::new(UdpSettings {
            host: String::new(),
            port,
            listen: true,
            first_packet_timeout_ms: Some(2000),
        });
        let open = tokio::spawn(async move { t.open().await });

        let vehicle = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut io = loop {
            vehicle.send_to(b"abc", ("127.0.0.1", port)).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if open.is_finished() {
                break open.await.unwrap().unwrap();
            }
        };

        let mut buf = [0u8; 16];
        let n = io.reader.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");

        io.writer.send(b"xyz").await.unwrap();
        let mut back = [0u8; 16];
        let (n, _) = vehicle.recv_from(&mut back).await.unwrap();
        assert_eq!(&back[..n], b"xyz");
    }
}
