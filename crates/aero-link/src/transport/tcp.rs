use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use super::{Transport, TransportIo};
use crate::error::TransportError;
use crate::settings::TcpSettings;

pub struct TcpTransport {
    settings: TcpSettings,
}

impl TcpTransport {
    pub fn new(settings: TcpSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    fn endpoint(&self) -> String {
        format!("tcp:{}:{}", self.settings.host, self.settings.port)
    }

    async fn open(&self) -> Result<TransportIo, TransportError> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let stream =
            match tokio::time::timeout(self.settings.connect_timeout(), TcpStream::connect(&addr)).await {
                Err(_) => return Err(TransportError::Timeout { endpoint: self.endpoint() }),
                Ok(Err(e)) => {
                    return Err(TransportError::HostUnreachable { host: addr, reason: e.to_string() })
                }
                Ok(Ok(s)) => s,
            };
        let _ = stream.set_nodelay(true);
        debug!("tcp: connected {}", addr);

        let (r, w) = stream.into_split();
        Ok(TransportIo::new(self.endpoint(), Box::new(r), Box::new(w)))
    }
}
