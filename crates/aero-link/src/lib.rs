pub mod autodetect;
pub mod error;
pub mod fanout;
pub mod pending;
pub mod session;
pub mod settings;
pub mod state;
pub mod transport;

pub use error::{ConcurrencyError, LinkError, TransportError};
pub use fanout::{Fanout, Subscription};
pub use pending::{Pending, PendingMap, WaitError};
pub use session::LinkSession;
pub use settings::{ConnectionSettings, LinkConfig, ParitySetting, SerialSettings, TcpSettings, UdpSettings};
pub use state::{LinkState, LinkStats};
pub use transport::{list_serial_ports, SerialPortEntry, Transport, TransportIo};
