use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use tracing::info;

use crate::domain::{Connection, DeviceConfig, DeviceType, DiscoveredDevice};
use crate::error::ConfigurationError;
use crate::transport::PortManager;

/// Per-device line of a status snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub connection: String,
    pub port: Option<String>,
    /// Serial devices only
    pub port_open: Option<bool>,
    pub enabled: bool,
    pub unit_id: u8,
    pub device_type: DeviceType,
    pub manufacturer: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub devices: Vec<DeviceStatus>,
    pub total_devices: usize,
    pub open_ports: usize,
    pub available_ports: usize,
    pub generated_at: DateTime<Utc>,
}

/// Thread-safe map of device ID to device configuration.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceConfig>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a device. Returns the previous config for `device_id`.
    pub fn add(
        &self,
        device_id: impl Into<String>,
        config: DeviceConfig,
    ) -> Result<Option<DeviceConfig>, ConfigurationError> {
        let device_id = device_id.into();
        if device_id.trim().is_empty() {
            return Err(ConfigurationError::Invalid("device id must not be empty".to_string()));
        }
        config.check()?;

        info!(
            device_id = %device_id,
            connection = %config.connection,
            unit_id = config.unit_id,
            "device registered"
        );
        Ok(self.devices.write().insert(device_id, config))
    }

    pub fn remove(&self, device_id: &str) -> Option<DeviceConfig> {
        let removed = self.devices.write().remove(device_id);
        if removed.is_some() {
            info!(device_id, "device removed");
        }
        removed
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceConfig> {
        self.devices.read().get(device_id).cloned()
    }

    /// All devices ordered by ID
    pub fn list_all(&self) -> Vec<(String, DeviceConfig)> {
        let mut devices: Vec<(String, DeviceConfig)> = self
            .devices
            .read()
            .iter()
            .map(|(id, config)| (id.clone(), config.clone()))
            .collect();
        devices.sort_by(|a, b| a.0.cmp(&b.0));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    pub fn contains_port(&self, port: &str) -> bool {
        self.devices
            .read()
            .values()
            .any(|d| d.connection.serial_port() == Some(port))
    }

    pub fn contains_host(&self, host: IpAddr) -> bool {
        self.devices
            .read()
            .values()
            .any(|d| matches!(d.connection, Connection::Tcp { host: h, .. } if h == host))
    }

    /// Registered device on `port` answering as `unit_id`
    pub fn device_for_unit(&self, port: &str, unit_id: u8) -> Option<String> {
        self.devices
            .read()
            .iter()
            .find(|(_, d)| d.unit_id == unit_id && d.connection.serial_port() == Some(port))
            .map(|(id, _)| id.clone())
    }

    /// Register a discovery unless its ID is already present.
    ///
    /// Returns whether a new entry was created.
    pub fn promote(
        &self,
        discovered: &DiscoveredDevice,
        register_count: u16,
    ) -> Result<bool, ConfigurationError> {
        let config = discovered.to_config(register_count);
        config.check()?;

        let mut devices = self.devices.write();
        if devices.contains_key(&discovered.device_id) {
            return Ok(false);
        }
        devices.insert(discovered.device_id.clone(), config);
        info!(
            device_id = %discovered.device_id,
            protocol = %discovered.protocol,
            manufacturer = %discovered.manufacturer,
            "discovered device promoted"
        );
        Ok(true)
    }

    /// Load statically configured devices
    pub fn seed(&self, devices: &BTreeMap<String, DeviceConfig>) -> Result<usize, ConfigurationError> {
        for (id, config) in devices {
            self.add(id.clone(), config.clone())?;
        }
        Ok(devices.len())
    }

    pub fn status_snapshot(&self, ports: &PortManager) -> RegistryStatus {
        let devices: Vec<DeviceStatus> = self
            .list_all()
            .into_iter()
            .map(|(device_id, config)| {
                let port = config.connection.serial_port().map(str::to_string);
                let port_open = port.as_deref().map(|p| ports.is_open(p));
                DeviceStatus {
                    device_id,
                    connection: config.connection.to_string(),
                    port,
                    port_open,
                    enabled: config.enabled,
                    unit_id: config.unit_id,
                    device_type: config.device_type,
                    manufacturer: config.manufacturer,
                    model: config.model,
                }
            })
            .collect();

        RegistryStatus {
            total_devices: devices.len(),
            open_ports: ports.open_ports().len(),
            available_ports: ports.available_ports().len(),
            devices,
            generated_at: Utc::now(),
        }
    }
}
