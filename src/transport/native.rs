use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{DataBits, SerialPortBuilderExt, SerialStream, StopBits};

use super::{PortOpener, SerialLink, SerialSettings};
use crate::domain::{Parity, SerialFraming};
use crate::error::TransportError;

/// Opens OS serial devices through `tokio-serial`.
#[derive(Debug, Default, Clone)]
pub struct NativeSerialOpener;

impl NativeSerialOpener {
    pub fn new() -> Self {
        Self
    }

    fn data_bits(framing: &SerialFraming) -> DataBits {
        match framing.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        }
    }

    fn parity(framing: &SerialFraming) -> tokio_serial::Parity {
        match framing.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }

    fn stop_bits(framing: &SerialFraming) -> StopBits {
        match framing.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        }
    }

    fn map_open_error(port: &str, e: tokio_serial::Error) -> TransportError {
        let reason = match e.kind {
            tokio_serial::ErrorKind::NoDevice => "no such device".to_string(),
            tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                "permission denied".to_string()
            }
            tokio_serial::ErrorKind::Io(std::io::ErrorKind::NotFound) => "not found".to_string(),
            _ => e.to_string(),
        };
        TransportError::PortUnavailable {
            port: port.to_string(),
            reason,
        }
    }
}

impl PortOpener for NativeSerialOpener {
    fn open(&self, settings: &SerialSettings) -> Result<Box<dyn SerialLink>, TransportError> {
        let stream = tokio_serial::new(settings.port.as_str(), settings.baud_rate)
            .data_bits(Self::data_bits(&settings.framing))
            .parity(Self::parity(&settings.framing))
            .stop_bits(Self::stop_bits(&settings.framing))
            .timeout(settings.read_timeout)
            .open_native_async()
            .map_err(|e| Self::map_open_error(&settings.port, e))?;

        Ok(Box::new(NativeSerialLink {
            port: settings.port.clone(),
            stream: Some(stream),
        }))
    }

    fn available_ports(&self) -> Result<Vec<String>, TransportError> {
        tokio_serial::available_ports()
            .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
            .map_err(|e| TransportError::PortUnavailable {
                port: "*".to_string(),
                reason: e.to_string(),
            })
    }
}

pub struct NativeSerialLink {
    port: String,
    stream: Option<SerialStream>,
}

impl NativeSerialLink {
    fn stream(&mut self) -> Result<&mut SerialStream, TransportError> {
        self.stream
            .as_mut()
            .ok_or_else(|| TransportError::Closed(self.port.clone()))
    }
}

#[async_trait]
impl SerialLink for NativeSerialLink {
    async fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let port = self.port.clone();
        let stream = self.stream()?;
        stream
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::io(port.as_str(), e))?;
        stream
            .flush()
            .await
            .map_err(|e| TransportError::io(port.as_str(), e))?;
        Ok(bytes.len())
    }

    async fn read_chunk(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        let port = self.port.clone();
        let stream = self.stream()?;
        let mut buf = vec![0u8; max_bytes];
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| TransportError::io(port.as_str(), e))?;
        buf.truncate(n);
        Ok(buf)
    }

    fn close(&mut self) {
        self.stream.take();
    }
}
