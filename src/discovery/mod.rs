//! Device discovery over RS-485 lines and the local network.

pub mod classify;
pub mod network;
pub mod serial;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use crate::domain::{DeviceType, DiscoveredDevice, DiscoveryStatus, Protocol};

pub use classify::{classify, Classification};
pub use network::{parse_target, NetworkDiscoveryEngine, NetworkProbe, NetworkScanSummary, TcpProbe};
pub use serial::{DeviceDiscoveryEngine, ScanSummary};

/// Counters across all discovery passes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryStats {
    pub total_discovered: usize,
    pub rtu_devices: usize,
    pub tcp_devices: usize,
    pub scan_cycles: u64,
    pub discovery_errors: u64,
    pub last_scan: Option<DateTime<Utc>>,
}

/// Every device the engines have reported, keyed by device ID.
#[derive(Default)]
pub struct DiscoveryLog {
    devices: RwLock<HashMap<String, DiscoveredDevice>>,
    stats: RwLock<DiscoveryStats>,
}

impl DiscoveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a discovery. A device seen before only has `last_seen` refreshed.
    ///
    /// Returns true for a device not seen before.
    pub fn record(&self, device: DiscoveredDevice) -> bool {
        let mut devices = self.devices.write();
        if let Some(existing) = devices.get_mut(&device.device_id) {
            existing.last_seen = device.last_seen;
            if existing.status == DiscoveryStatus::Offline {
                existing.status = DiscoveryStatus::Online;
                info!(device_id = %existing.device_id, "device back online");
            }
            return false;
        }

        let mut stats = self.stats.write();
        stats.total_discovered += 1;
        match device.protocol {
            Protocol::ModbusRtu => stats.rtu_devices += 1,
            Protocol::ModbusTcp => stats.tcp_devices += 1,
        }
        devices.insert(device.device_id.clone(), device);
        true
    }

    pub fn get(&self, device_id: &str) -> Option<DiscoveredDevice> {
        self.devices.read().get(device_id).cloned()
    }

    pub fn contains_port(&self, port: &str) -> bool {
        self.devices
            .read()
            .values()
            .any(|d| d.serial_port() == Some(port))
    }

    pub fn set_status(&self, device_id: &str, status: DiscoveryStatus) -> bool {
        match self.devices.write().get_mut(device_id) {
            Some(device) => {
                device.status = status;
                true
            }
            None => false,
        }
    }

    /// Mark `protocol` devices not seen within `max_age` offline. Returns their IDs.
    pub fn mark_offline(&self, protocol: Protocol, max_age: Duration, now: DateTime<Utc>) -> Vec<String> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut stale = Vec::new();
        for device in self.devices.write().values_mut() {
            if device.protocol == protocol
                && device.status != DiscoveryStatus::Offline
                && now - device.last_seen > max_age
            {
                device.status = DiscoveryStatus::Offline;
                stale.push(device.device_id.clone());
            }
        }
        stale.sort();
        stale
    }

    /// Forget a device so its port or host is scanned again
    pub fn forget(&self, device_id: &str) -> Option<DiscoveredDevice> {
        self.devices.write().remove(device_id)
    }

    pub fn list(&self) -> Vec<DiscoveredDevice> {
        self.filtered(|_| true)
    }

    fn filtered(&self, keep: impl Fn(&DiscoveredDevice) -> bool) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<DiscoveredDevice> =
            self.devices.read().values().filter(|d| keep(d)).cloned().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    pub fn by_type(&self, device_type: DeviceType) -> Vec<DiscoveredDevice> {
        self.filtered(|d| d.device_type == device_type)
    }

    pub fn by_protocol(&self, protocol: Protocol) -> Vec<DiscoveredDevice> {
        self.filtered(|d| d.protocol == protocol)
    }

    pub fn record_scan(&self, errors: u64) {
        let mut stats = self.stats.write();
        stats.scan_cycles += 1;
        stats.discovery_errors += errors;
        stats.last_scan = Some(Utc::now());
    }

    pub fn stats(&self) -> DiscoveryStats {
        self.stats.read().clone()
    }
}
