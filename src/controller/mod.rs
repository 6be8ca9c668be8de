pub mod scheduler;

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery::{
    DeviceDiscoveryEngine, DiscoveryLog, DiscoveryStats, NetworkDiscoveryEngine, NetworkProbe,
    NetworkScanSummary, ScanSummary, TcpProbe,
};
use crate::domain::{Connection, DeviceConfig, DeviceReading, DiscoveredDevice, DiscoveryStatus};
use crate::error::{ConfigurationError, PollError, TransportError};
use crate::modbus::codec;
use crate::polling::{ContinuousPollingTester, RegisterReader, RtuTarget, TestResult, TestResultStore};
use crate::registry::{DeviceRegistry, RegistryStatus};
use crate::transport::{NativeSerialOpener, PortFrame, PortListener, PortManager, PortOpener, SerialSettings};

pub use scheduler::{GatewayJob, ScanScheduler, ScheduledJob, TaskStatus};

/// Frames buffered per monitored port
const LISTENER_CAPACITY: usize = 32;

/// Owns the registry, the port table and every engine working on them.
pub struct Gateway {
    pub cfg: Config,
    pub registry: Arc<DeviceRegistry>,
    pub ports: PortManager,
    pub discoveries: Arc<DiscoveryLog>,
    pub results: Arc<TestResultStore>,
    serial: DeviceDiscoveryEngine,
    network: NetworkDiscoveryEngine,
    tester: ContinuousPollingTester,
    #[cfg_attr(not(feature = "modbus"), allow(dead_code))]
    probe: Arc<dyn NetworkProbe>,
}

impl Gateway {
    pub fn new(cfg: Config, opener: Arc<dyn PortOpener>, probe: Arc<dyn NetworkProbe>) -> Self {
        let ports = PortManager::new(opener).with_fallback_ports(cfg.serial.ports.clone());
        let registry = Arc::new(DeviceRegistry::new());
        let discoveries = Arc::new(DiscoveryLog::new());
        let shutdown = ports.shutdown_token();

        let serial = DeviceDiscoveryEngine::new(
            ports.clone(),
            Arc::clone(&registry),
            Arc::clone(&discoveries),
            cfg.serial.clone(),
        );
        let network = NetworkDiscoveryEngine::new(
            Arc::clone(&probe),
            Arc::clone(&discoveries),
            cfg.network.clone(),
            shutdown.clone(),
        );
        let tester = ContinuousPollingTester::new(cfg.polling.clone(), shutdown);

        Self {
            cfg,
            registry,
            ports,
            discoveries,
            results: Arc::new(TestResultStore::new()),
            serial,
            network,
            tester,
            probe,
        }
    }

    /// Gateway on the OS serial ports and plain TCP probes
    pub fn from_config(cfg: Config) -> Self {
        let probe = Arc::new(TcpProbe::new(cfg.network.connect_timeout()));
        Self::new(cfg, Arc::new(NativeSerialOpener), probe)
    }

    /// Register the statically configured devices
    pub fn seed_devices(&self) -> Result<usize, ConfigurationError> {
        let seeded = self.registry.seed(&self.cfg.devices)?;
        if seeded > 0 {
            info!(devices = seeded, "static devices registered");
        }
        Ok(seeded)
    }

    fn promote(&self, device: &DiscoveredDevice) {
        match self.registry.promote(device, self.cfg.discovery.register_count) {
            Ok(true) => {
                self.discoveries
                    .set_status(&device.device_id, DiscoveryStatus::Registered);
            }
            Ok(false) => {}
            Err(e) => warn!(device_id = %device.device_id, error = %e, "discovery not registered"),
        }
    }

    pub async fn run_serial_scan(&self) -> ScanSummary {
        if !self.cfg.discovery.serial_enabled {
            debug!("serial discovery disabled");
            return ScanSummary::default();
        }
        let summary = self.serial.scan_all().await;
        if self.cfg.discovery.auto_register {
            for device in &summary.devices_found {
                self.promote(device);
            }
        }
        summary
    }

    pub async fn run_network_scan(&self) -> NetworkScanSummary {
        if !self.cfg.network.enabled {
            debug!("network discovery disabled");
            return NetworkScanSummary::default();
        }
        let summary = self.network.scan().await;
        if self.cfg.discovery.auto_register {
            for device in &summary.devices_found {
                // hosts registered by hand under another ID stay as they are
                let registered_elsewhere = matches!(device.connection, Connection::Tcp { host, .. }
                    if self.registry.contains_host(host) && self.registry.get(&device.device_id).is_none());
                if !registered_elsewhere {
                    self.promote(device);
                }
            }
        }
        summary
    }

    fn reader_for(&self, device_id: &str, config: &DeviceConfig) -> Option<Box<dyn RegisterReader>> {
        match &config.connection {
            Connection::Serial { .. } => {
                RtuTarget::from_config(device_id, config, self.ports.clone(), &self.cfg.serial)
                    .map(|t| Box::new(t) as Box<dyn RegisterReader>)
            }
            #[cfg(feature = "modbus")]
            Connection::Tcp { .. } => crate::polling::TcpTarget::from_config(
                device_id,
                config,
                Arc::clone(&self.probe),
                self.cfg.network.connect_timeout(),
            )
            .map(|t| Box::new(t) as Box<dyn RegisterReader>),
            #[cfg(not(feature = "modbus"))]
            Connection::Tcp { .. } => None,
        }
    }

    /// Run the staged test against a registered device and keep the result.
    pub async fn test_device(&self, device_id: &str) -> Option<TestResult> {
        let config = self.registry.get(device_id)?;
        let result = match self.reader_for(device_id, &config) {
            Some(reader) => self.tester.run_test(&config, reader.as_ref()).await,
            None => TestResult::not_testable(device_id, &config, "Modbus-TCP support not built in"),
        };

        if self.discoveries.get(device_id).is_some() {
            let status = if result.success {
                DiscoveryStatus::Online
            } else {
                DiscoveryStatus::Offline
            };
            self.discoveries.set_status(device_id, status);
        }
        self.results.insert(result.clone());
        Some(result)
    }

    /// Test every enabled device whose latest run did not pass, untested ones included.
    ///
    /// Devices sharing a serial port are tested one after another; each port
    /// and each TCP device gets its own task. Returns the number tested.
    pub async fn validate_pending(self: Arc<Self>) -> Result<usize> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (device_id, config) in self.registry.list_all() {
            if !config.enabled || self.results.passed(&device_id) {
                continue;
            }
            let group = match config.connection.serial_port() {
                Some(port) => port.to_string(),
                None => device_id.clone(),
            };
            groups.entry(group).or_default().push(device_id);
        }
        if groups.is_empty() {
            return Ok(0);
        }

        let mut tests = JoinSet::new();
        for (_, device_ids) in groups {
            let gateway = Arc::clone(&self);
            tests.spawn(async move {
                let mut tested = 0usize;
                for device_id in device_ids {
                    if gateway.ports.is_shutting_down() {
                        break;
                    }
                    if gateway.test_device(&device_id).await.is_some() {
                        tested += 1;
                    }
                }
                tested
            });
        }

        let mut tested = 0;
        let mut failures = Vec::new();
        while let Some(joined) = tests.join_next().await {
            match joined {
                Ok(n) => tested += n,
                Err(e) => failures.push(e.to_string()),
            }
        }
        info!(tested, "validation pass complete");
        if failures.is_empty() {
            Ok(tested)
        } else {
            Err(anyhow!("{} validation task(s) failed: {}", failures.len(), failures.join("; ")))
        }
    }

    /// One read of the configured register block of a registered device.
    pub async fn read_device(&self, device_id: &str) -> Result<DeviceReading, PollError> {
        let config = self
            .registry
            .get(device_id)
            .ok_or_else(|| PollError::UnknownDevice(device_id.to_string()))?;
        let reader = self
            .reader_for(device_id, &config)
            .ok_or_else(|| PollError::Unsupported(device_id.to_string()))?;
        let registers = reader
            .read_registers(config.start_address, config.register_count)
            .await?;
        Ok(DeviceReading::new(device_id, config.unit_id, config.start_address, registers))
    }

    /// Open `port` in monitoring mode; frames arrive through the listener.
    pub fn monitor_port(&self, port: &str, baud_rate: u32) -> Result<PortListener, TransportError> {
        let settings = SerialSettings::new(port, baud_rate)
            .with_timeouts(self.cfg.serial.read_timeout(), self.cfg.serial.write_timeout());
        let handle = self.ports.open(&settings)?;
        info!(port, baud_rate, "monitoring port");
        Ok(handle.into_listener(LISTENER_CAPACITY, self.cfg.serial.read_buffer))
    }

    /// Registered device a received frame belongs to, by port and unit ID.
    pub fn route_frame(&self, frame: &PortFrame) -> Option<String> {
        if !codec::has_valid_crc(&frame.bytes) {
            debug!(port = %frame.port, len = frame.bytes.len(), "dropping frame with bad CRC");
            return None;
        }
        let unit_id = *frame.bytes.first()?;
        let device_id = self.registry.device_for_unit(&frame.port, unit_id);
        match &device_id {
            Some(id) => debug!(port = %frame.port, unit_id, device_id = %id, "frame routed"),
            None => debug!(port = %frame.port, unit_id, "no device registered for unit"),
        }
        device_id
    }

    fn release_if_unused(&self, port: &str) {
        if !self.registry.contains_port(port) && self.ports.release(port) {
            info!(port, "port released");
        }
    }

    /// Register or replace a device.
    ///
    /// A replacement on another connection drops the old test result, and the
    /// old port is released once no other device uses it.
    pub fn add_device(
        &self,
        device_id: &str,
        config: DeviceConfig,
    ) -> Result<Option<DeviceConfig>, ConfigurationError> {
        let connection = config.connection.clone();
        let previous = self.registry.add(device_id, config)?;
        if let Some(old) = previous.as_ref().filter(|old| old.connection != connection) {
            self.results.remove(device_id);
            if let Some(port) = old.connection.serial_port() {
                self.release_if_unused(port);
            }
        }
        Ok(previous)
    }

    /// Remove a device. Its port is released once no other device uses it.
    pub fn remove_device(&self, device_id: &str) -> Option<DeviceConfig> {
        let removed = self.registry.remove(device_id)?;
        self.results.remove(device_id);
        self.discoveries.forget(device_id);
        if let Some(port) = removed.connection.serial_port() {
            self.release_if_unused(port);
        }
        Some(removed)
    }

    pub fn status(&self) -> RegistryStatus {
        self.registry.status_snapshot(&self.ports)
    }

    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.discoveries.list()
    }

    pub fn discovery_stats(&self) -> DiscoveryStats {
        self.discoveries.stats()
    }

    pub fn report(&self) -> String {
        self.results.generate_report()
    }
}
