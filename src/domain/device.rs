use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use validator::{Validate, ValidationError};

use crate::error::ConfigurationError;

/// Modbus-TCP listener port
pub const MODBUS_TCP_PORT: u16 = 502;

/// Wire protocol a device was found on
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Protocol {
    ModbusRtu,
    ModbusTcp,
}

/// Device category
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum DeviceType {
    SolarInverter,
    EnergyMeter,
    Battery,
    #[default]
    GenericModbus,
}

/// Lifecycle of a discovery record
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum DiscoveryStatus {
    Discovered,
    Registered,
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Character framing on a serial line. Defaults to 8-N-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialFraming {
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl Default for SerialFraming {
    fn default() -> Self {
        Self {
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

/// Where a device is reached
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Connection {
    Serial { port: String, baud_rate: u32 },
    Tcp { host: IpAddr, port: u16 },
}

impl Connection {
    pub fn protocol(&self) -> Protocol {
        match self {
            Connection::Serial { .. } => Protocol::ModbusRtu,
            Connection::Tcp { .. } => Protocol::ModbusTcp,
        }
    }

    pub fn serial_port(&self) -> Option<&str> {
        match self {
            Connection::Serial { port, .. } => Some(port),
            Connection::Tcp { .. } => None,
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Connection::Tcp { host, port } => Some(SocketAddr::new(*host, *port)),
            Connection::Serial { .. } => None,
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connection::Serial { port, baud_rate } => write!(f, "{port}@{baud_rate}"),
            Connection::Tcp { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

fn validate_connection(connection: &Connection) -> Result<(), ValidationError> {
    match connection {
        Connection::Serial { port, baud_rate } => {
            if port.trim().is_empty() {
                return Err(ValidationError::new("empty_port"));
            }
            if !(1200..=115_200).contains(baud_rate) {
                return Err(ValidationError::new("baud_rate_out_of_range"));
            }
        }
        Connection::Tcp { port, .. } => {
            if *port == 0 {
                return Err(ValidationError::new("tcp_port_zero"));
            }
        }
    }
    Ok(())
}

fn validate_framing(framing: &SerialFraming) -> Result<(), ValidationError> {
    if !(5..=8).contains(&framing.data_bits) {
        return Err(ValidationError::new("data_bits_out_of_range"));
    }
    if !(1..=2).contains(&framing.stop_bits) {
        return Err(ValidationError::new("stop_bits_out_of_range"));
    }
    Ok(())
}

fn default_register_count() -> u16 {
    10
}

fn default_unknown() -> String {
    "UNKNOWN".to_string()
}

fn default_true() -> bool {
    true
}

/// Connection and identity parameters for one registered device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct DeviceConfig {
    #[validate(custom(function = "validate_connection"))]
    pub connection: Connection,
    #[validate(range(min = 1, max = 247))]
    pub unit_id: u8,
    #[serde(default)]
    pub start_address: u16,
    #[serde(default = "default_register_count")]
    #[validate(range(min = 1, max = 125))]
    pub register_count: u16,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default = "default_unknown")]
    pub manufacturer: String,
    #[serde(default = "default_unknown")]
    pub model: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    #[validate(custom(function = "validate_framing"))]
    pub framing: SerialFraming,
}

impl DeviceConfig {
    pub fn serial(port: impl Into<String>, baud_rate: u32, unit_id: u8) -> Self {
        Self::with_connection(
            Connection::Serial {
                port: port.into(),
                baud_rate,
            },
            unit_id,
        )
    }

    pub fn tcp(host: IpAddr, unit_id: u8) -> Self {
        Self::with_connection(
            Connection::Tcp {
                host,
                port: MODBUS_TCP_PORT,
            },
            unit_id,
        )
    }

    fn with_connection(connection: Connection, unit_id: u8) -> Self {
        Self {
            connection,
            unit_id,
            start_address: 0,
            register_count: default_register_count(),
            device_type: DeviceType::default(),
            manufacturer: default_unknown(),
            model: default_unknown(),
            enabled: true,
            framing: SerialFraming::default(),
        }
    }

    /// Run field validation, mapping failures onto the gateway error type.
    pub fn check(&self) -> Result<(), ConfigurationError> {
        self.validate()?;
        Ok(())
    }
}

/// Serial discoveries are keyed by port and unit so rediscovery is stable.
pub fn serial_device_id(port: &str, unit_id: u8) -> String {
    let sanitized: String = port
        .trim_start_matches("/dev/")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("rtu_{sanitized}_{unit_id}")
}

pub fn network_device_id(host: IpAddr) -> String {
    let sanitized: String = host
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("network_{sanitized}")
}

/// A device found by a discovery pass, before promotion into the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub device_id: String,
    pub device_type: DeviceType,
    pub protocol: Protocol,
    pub connection: Connection,
    pub unit_id: u8,
    pub manufacturer: String,
    pub model: String,
    pub status: DiscoveryStatus,
    pub discovered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Round trip of the exchange that identified the device
    pub response_latency_ms: Option<u64>,
}

impl DiscoveredDevice {
    pub fn serial_port(&self) -> Option<&str> {
        self.connection.serial_port()
    }

    pub fn baud_rate(&self) -> Option<u32> {
        match self.connection {
            Connection::Serial { baud_rate, .. } => Some(baud_rate),
            Connection::Tcp { .. } => None,
        }
    }

    /// Registry config for this device
    pub fn to_config(&self, register_count: u16) -> DeviceConfig {
        DeviceConfig {
            device_type: self.device_type,
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            register_count,
            ..DeviceConfig::with_connection(self.connection.clone(), self.unit_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_device_ids() {
        assert_eq!(serial_device_id("/dev/ttyUSB0", 3), "rtu_ttyUSB0_3");
        assert_eq!(serial_device_id("SIM0", 1), "rtu_SIM0_1");
        assert_eq!(
            network_device_id("192.168.1.20".parse().unwrap()),
            "network_192_168_1_20"
        );
    }

    #[test]
    fn test_enum_strings() {
        assert_eq!(Protocol::ModbusTcp.to_string(), "MODBUS_TCP");
        assert_eq!(DeviceType::from_str("solar_inverter").unwrap(), DeviceType::SolarInverter);
        assert_eq!(DiscoveryStatus::Discovered.to_string(), "DISCOVERED");
        assert_eq!(
            serde_json::to_string(&DeviceType::GenericModbus).unwrap(),
            "\"GENERIC_MODBUS\""
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(DeviceConfig::serial("/dev/ttyUSB0", 9600, 1).check().is_ok());
        assert!(DeviceConfig::serial("/dev/ttyUSB0", 9600, 0).check().is_err());
        assert!(DeviceConfig::serial("/dev/ttyUSB0", 9600, 248).check().is_err());
        assert!(DeviceConfig::serial("", 9600, 1).check().is_err());
        assert!(DeviceConfig::serial("/dev/ttyUSB0", 300, 1).check().is_err());

        let mut config = DeviceConfig::tcp("10.0.0.5".parse().unwrap(), 1);
        config.register_count = 126;
        assert!(matches!(config.check(), Err(ConfigurationError::Invalid(_))));
    }

    #[test]
    fn test_config_deserialize_defaults() {
        let config: DeviceConfig = serde_json::from_str(
            r#"{"connection":{"kind":"serial","port":"/dev/ttyUSB1","baud_rate":19200},"unit_id":2}"#,
        )
        .unwrap();
        assert_eq!(config.register_count, 10);
        assert_eq!(config.manufacturer, "UNKNOWN");
        assert!(config.enabled);
        assert_eq!(config.framing, SerialFraming::default());
    }
}
