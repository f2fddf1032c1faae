use async_trait::async_trait;
use serde::Serialize;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialPortType, StopBits};
use tracing::debug;

use super::{Transport, TransportIo};
use crate::error::TransportError;
use crate::settings::{ParitySetting, SerialSettings};

pub struct SerialTransport {
    settings: SerialSettings,
}

impl SerialTransport {
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings }
    }

    fn unavailable(&self, reason: impl Into<String>) -> TransportError {
        TransportError::PortUnavailable { port: self.settings.port.clone(), reason: reason.into() }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> &'static str {
        "serial"
    }

    fn endpoint(&self) -> String {
        format!("serial:{}:{}", self.settings.port, self.settings.baud)
    }

    async fn open(&self) -> Result<TransportIo, TransportError> {
        let s = &self.settings;
        let data_bits = match s.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => return Err(self.unavailable(format!("unsupported data bits {}", other))),
        };
        let stop_bits = match s.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => return Err(self.unavailable(format!("unsupported stop bits {}", other))),
        };
        let parity = match s.parity {
            ParitySetting::None => Parity::None,
            ParitySetting::Odd => Parity::Odd,
            ParitySetting::Even => Parity::Even,
        };

        let port = tokio_serial::new(&s.port, s.baud)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .open_native_async()
            .map_err(|e| match e.kind {
                tokio_serial::ErrorKind::Io(std::io::ErrorKind::TimedOut) => {
                    TransportError::Timeout { endpoint: self.endpoint() }
                }
                _ => self.unavailable(e.to_string()),
            })?;
        debug!("serial: opened {} @ {}", s.port, s.baud);

        let (r, w) = tokio::io::split(port);
        Ok(TransportIo::new(self.endpoint(), Box::new(r), Box::new(w)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SerialPortEntry {
    pub name: String,
    pub label: String,
}

/// Enumerate serial ports. Works regardless of any session state.
pub fn list_serial_ports() -> Result<Vec<SerialPortEntry>, TransportError> {
    let ports = tokio_serial::available_ports().map_err(|e| TransportError::PortUnavailable {
        port: "*".into(),
        reason: e.to_string(),
    })?;

    Ok(ports
        .into_iter()
        .map(|p| {
            let label = match &p.port_type {
                SerialPortType::UsbPort(usb) => match (&usb.manufacturer, &usb.product) {
                    (_, Some(product)) => format!("{} ({})", product, p.port_name),
                    (Some(vendor), None) => format!("{} ({})", vendor, p.port_name),
                    (None, None) => format!("USB {:04x}:{:04x} ({})", usb.vid, usb.pid, p.port_name),
                },
                SerialPortType::BluetoothPort => format!("Bluetooth ({})", p.port_name),
                SerialPortType::PciPort => format!("PCI serial ({})", p.port_name),
                SerialPortType::Unknown => p.port_name.clone(),
            };
            SerialPortEntry { name: p.port_name, label }
        })
        .collect())
}
