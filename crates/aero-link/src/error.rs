use aero_proto::FrameError;

/// I/O level failures. Recoverable by reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("port {port} unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },

    #[error("timed out opening {endpoint}")]
    Timeout { endpoint: String },

    #[error("host {host} unreachable: {reason}")]
    HostUnreachable { host: String, reason: String },

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("transport closed by peer")]
    Closed,

    #[error("read failed: {0}")]
    ReadFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("link not connected")]
    NotConnected,

    #[error("link already active")]
    AlreadyActive,

    #[error("link disconnected")]
    Disconnected,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("cannot frame message: {0}")]
    Frame(#[from] FrameError),
}

/// A conflicting operation is already in flight.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConcurrencyError {
    #[error("operation already pending for {0}")]
    AlreadyPending(String),

    #[error("calibration already in progress")]
    CalibrationAlreadyInProgress,

    #[error("parameter download already in progress")]
    DownloadInProgress,
}
