use async_trait::async_trait;
use tokio::time::sleep;
use tracing::debug;

use crate::config::SerialConfig;
use crate::domain::{Connection, DeviceConfig};
use crate::error::PollError;
use crate::modbus::codec::{self, READ_HOLDING_REGISTERS};
use crate::transport::{PortHandle, PortManager, SerialSettings};

/// Something holding registers can be read from.
#[async_trait]
pub trait RegisterReader: Send + Sync {
    /// Device ID of the target
    fn target(&self) -> &str;

    /// Whether the underlying port or host can be reached at all
    async fn is_available(&self) -> bool;

    /// One read of `count` holding registers starting at `start`
    async fn read_registers(&self, start: u16, count: u16) -> Result<Vec<u16>, PollError>;
}

/// RTU device on a serial line, read through the shared port table.
pub struct RtuTarget {
    device_id: String,
    ports: PortManager,
    settings: SerialSettings,
    unit_id: u8,
    serial: SerialConfig,
}

impl RtuTarget {
    /// Build a reader for a serial device config. Returns `None` for TCP devices.
    pub fn from_config(
        device_id: impl Into<String>,
        config: &DeviceConfig,
        ports: PortManager,
        serial: &SerialConfig,
    ) -> Option<Self> {
        let Connection::Serial { port, baud_rate } = &config.connection else {
            return None;
        };
        let settings = SerialSettings::new(port.clone(), *baud_rate)
            .with_timeouts(serial.read_timeout(), serial.write_timeout())
            .with_framing(config.framing);

        Some(Self {
            device_id: device_id.into(),
            ports,
            settings,
            unit_id: config.unit_id,
            serial: serial.clone(),
        })
    }

    async fn exchange(&self, handle: &mut PortHandle, start: u16, count: u16) -> Result<Vec<u16>, PollError> {
        let request = codec::build_read_request(self.unit_id, READ_HOLDING_REGISTERS, start, count);
        handle.write(&request).await?;
        sleep(self.serial.settle_delay(self.settings.baud_rate, count)).await;

        let max = self.serial.read_buffer.max(codec::response_len(count));
        let response = handle.read(max, self.serial.read_timeout()).await?;
        if response.is_empty() {
            return Err(PollError::NoResponse(self.device_id.clone()));
        }
        Ok(codec::decode_read_response(&response, self.unit_id, count)?)
    }
}

#[async_trait]
impl RegisterReader for RtuTarget {
    fn target(&self) -> &str {
        &self.device_id
    }

    async fn is_available(&self) -> bool {
        let port = &self.settings.port;
        if self.ports.is_open(port) || self.ports.available_ports().iter().any(|p| p == port) {
            return true;
        }
        match self.ports.open(&self.settings) {
            Ok(handle) => {
                handle.park();
                true
            }
            Err(e) => {
                debug!(port = %port, error = %e, "port not available");
                false
            }
        }
    }

    async fn read_registers(&self, start: u16, count: u16) -> Result<Vec<u16>, PollError> {
        let mut handle = self.ports.open(&self.settings)?;
        let result = self.exchange(&mut handle, start, count).await;
        match &result {
            Err(e) if e.is_transport() => handle.close(),
            _ => handle.park(),
        }
        result
    }
}

#[cfg(feature = "modbus")]
pub use tcp::TcpTarget;

#[cfg(feature = "modbus")]
mod tcp {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    use crate::discovery::NetworkProbe;
    use crate::modbus::ModbusTcpClient;

    /// Modbus-TCP device, read over one lazily connected MBAP session.
    pub struct TcpTarget {
        device_id: String,
        addr: SocketAddr,
        unit_id: u8,
        timeout: Duration,
        probe: Arc<dyn NetworkProbe>,
        client: Mutex<Option<ModbusTcpClient>>,
    }

    impl TcpTarget {
        /// Returns `None` for serial devices.
        pub fn from_config(
            device_id: impl Into<String>,
            config: &DeviceConfig,
            probe: Arc<dyn NetworkProbe>,
            timeout: Duration,
        ) -> Option<Self> {
            let addr = config.connection.socket_addr()?;
            Some(Self {
                device_id: device_id.into(),
                addr,
                unit_id: config.unit_id,
                timeout,
                probe,
                client: Mutex::new(None),
            })
        }

        fn tcp_error(&self, e: anyhow::Error) -> PollError {
            PollError::Tcp {
                addr: self.addr,
                message: format!("{e:#}"),
            }
        }
    }

    #[async_trait]
    impl RegisterReader for TcpTarget {
        fn target(&self) -> &str {
            &self.device_id
        }

        async fn is_available(&self) -> bool {
            self.probe.probe(self.addr).await
        }

        async fn read_registers(&self, start: u16, count: u16) -> Result<Vec<u16>, PollError> {
            let mut session = self.client.lock().await;
            let client = match session.as_ref() {
                Some(client) => client.clone(),
                None => {
                    let client = ModbusTcpClient::connect_with_timeout(self.addr, self.unit_id, self.timeout)
                        .await
                        .map_err(|e| self.tcp_error(e))?;
                    *session = Some(client.clone());
                    client
                }
            };

            match client.read_holding_registers(start, count).await {
                Ok(registers) if registers.len() == usize::from(count) => Ok(registers),
                Ok(registers) => Err(PollError::Frame(crate::error::FrameError::ByteCountMismatch {
                    expected: usize::from(count) * 2,
                    actual: registers.len() * 2,
                })),
                Err(e) => {
                    // reconnect on the next read
                    *session = None;
                    Err(self.tcp_error(e))
                }
            }
        }
    }
}
