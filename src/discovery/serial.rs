use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::{classify, DiscoveryLog};
use crate::config::SerialConfig;
use crate::domain::{serial_device_id, Connection, DiscoveredDevice, DiscoveryStatus, Protocol};
use crate::error::TransportError;
use crate::modbus::codec::{self, READ_HOLDING_REGISTERS};
use crate::registry::DeviceRegistry;
use crate::transport::{PortHandle, PortManager, SerialSettings};

/// Outcome of one pass over the serial ports
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanSummary {
    pub ports_scanned: usize,
    pub ports_skipped: usize,
    pub devices_found: Vec<DiscoveredDevice>,
    pub errors: usize,
}

struct UnitMatch {
    unit_id: u8,
    latency: Duration,
}

/// Finds RTU devices by trying every baud rate and unit ID on each port.
pub struct DeviceDiscoveryEngine {
    ports: PortManager,
    registry: Arc<DeviceRegistry>,
    log: Arc<DiscoveryLog>,
    cfg: SerialConfig,
}

impl DeviceDiscoveryEngine {
    pub fn new(
        ports: PortManager,
        registry: Arc<DeviceRegistry>,
        log: Arc<DiscoveryLog>,
        cfg: SerialConfig,
    ) -> Self {
        Self {
            ports,
            registry,
            log,
            cfg,
        }
    }

    /// Scan every enumerated port.
    pub async fn scan_all(&self) -> ScanSummary {
        let ports = self.ports.available_ports();
        self.scan_ports(&ports).await
    }

    pub async fn scan_ports(&self, ports: &[String]) -> ScanSummary {
        let mut summary = ScanSummary::default();

        for port in ports {
            if self.ports.is_shutting_down() {
                break;
            }
            if self.is_known(port) {
                summary.ports_skipped += 1;
                continue;
            }

            summary.ports_scanned += 1;
            match self.scan_port(port).await {
                Ok(Some(device)) => summary.devices_found.push(device),
                Ok(None) => {}
                Err(TransportError::Closed(_)) => break,
                Err(e) => {
                    summary.errors += 1;
                    warn!(port = %port, error = %e, "skipping port");
                }
            }
        }

        self.log.record_scan(summary.errors as u64);
        info!(
            scanned = summary.ports_scanned,
            skipped = summary.ports_skipped,
            found = summary.devices_found.len(),
            errors = summary.errors,
            "serial discovery pass complete"
        );
        summary
    }

    /// Registered or already discovered ports are never probed again.
    fn is_known(&self, port: &str) -> bool {
        self.registry.contains_port(port) || self.log.contains_port(port)
    }

    /// Search one port for a responding device.
    ///
    /// On a match the port is left open (parked) for later polling.
    pub async fn scan_port(&self, port: &str) -> Result<Option<DiscoveredDevice>, TransportError> {
        if self.is_known(port) {
            debug!(port, "port already known");
            return Ok(None);
        }

        for &baud_rate in &self.cfg.baud_rates {
            let settings = SerialSettings::new(port, baud_rate)
                .with_timeouts(self.cfg.read_timeout(), self.cfg.write_timeout());
            let mut handle = match self.ports.open(&settings) {
                Ok(handle) => handle,
                Err(TransportError::PortBusy(_)) => {
                    debug!(port, "port in use, retrying next pass");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            debug!(port, baud_rate, "probing");
            match self.probe_units(&mut handle).await? {
                Some(found) => {
                    let device = self.discovered(port, baud_rate, &found);
                    handle.park();
                    self.log.record(device.clone());
                    info!(
                        port,
                        baud_rate,
                        unit_id = found.unit_id,
                        manufacturer = %device.manufacturer,
                        latency_ms = found.latency.as_millis() as u64,
                        "device discovered"
                    );
                    return Ok(Some(device));
                }
                None => handle.close(),
            }
        }

        debug!(port, "no device answered");
        Ok(None)
    }

    async fn probe_units(&self, handle: &mut PortHandle) -> Result<Option<UnitMatch>, TransportError> {
        let settle = self.cfg.settle_delay(handle.baud_rate(), 1);

        for unit_id in self.cfg.unit_ids.ids() {
            let request = codec::build_read_request(unit_id, READ_HOLDING_REGISTERS, 0, 1);
            let started = Instant::now();
            match handle.write(&request).await {
                Ok(_) => {}
                Err(TransportError::CommunicationTimeout { .. }) => {
                    // line is stuck at this speed; try the next baud rate
                    debug!(port = handle.port(), baud_rate = handle.baud_rate(), unit_id, "write timed out");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
            sleep(settle).await;

            let response = handle
                .read(self.cfg.read_buffer, self.cfg.read_timeout())
                .await?;
            if response.is_empty() {
                continue;
            }
            match codec::check_response(&response, unit_id) {
                Ok(()) => {
                    return Ok(Some(UnitMatch {
                        unit_id,
                        latency: started.elapsed(),
                    }))
                }
                Err(reason) => {
                    debug!(port = handle.port(), unit_id, %reason, "response rejected");
                }
            }
        }
        Ok(None)
    }

    fn discovered(&self, port: &str, baud_rate: u32, found: &UnitMatch) -> DiscoveredDevice {
        let class = classify(baud_rate);
        let now = Utc::now();
        DiscoveredDevice {
            device_id: serial_device_id(port, found.unit_id),
            device_type: class.device_type,
            protocol: Protocol::ModbusRtu,
            connection: Connection::Serial {
                port: port.to_string(),
                baud_rate,
            },
            unit_id: found.unit_id,
            manufacturer: class.manufacturer.to_string(),
            model: class.model.to_string(),
            status: DiscoveryStatus::Discovered,
            discovered_at: now,
            last_seen: now,
            response_latency_ms: Some(found.latency.as_millis() as u64),
        }
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::config::UnitRange;
    use crate::domain::{DeviceConfig, DeviceType};
    use crate::transport::sim::{Reply, SimulatedBus, SimulatedDevice};

    fn fast_config() -> SerialConfig {
        SerialConfig {
            read_timeout_ms: 5,
            write_timeout_ms: 50,
            settle_delay_ms: 0,
            scale_settle_delay: false,
            ..SerialConfig::default()
        }
    }

    fn engine(bus: &SimulatedBus) -> (DeviceDiscoveryEngine, PortManager, Arc<DeviceRegistry>, Arc<DiscoveryLog>) {
        let ports = PortManager::new(Arc::new(bus.clone()));
        let registry = Arc::new(DeviceRegistry::new());
        let log = Arc::new(DiscoveryLog::new());
        let engine = DeviceDiscoveryEngine::new(ports.clone(), registry.clone(), log.clone(), fast_config());
        (engine, ports, registry, log)
    }

    #[tokio::test]
    async fn test_finds_device_at_19200_unit_3() {
        let bus = SimulatedBus::new();
        bus.add_device("SIM0", SimulatedDevice::new(19_200, 3));
        let (engine, ports, _, log) = engine(&bus);

        let summary = engine.scan_ports(&["SIM0".to_string()]).await;
        assert_eq!(summary.devices_found.len(), 1);

        let device = &summary.devices_found[0];
        assert_eq!(device.serial_port(), Some("SIM0"));
        assert_eq!(device.baud_rate(), Some(19_200));
        assert_eq!(device.unit_id, 3);
        assert_eq!(device.status, DiscoveryStatus::Discovered);
        assert_eq!(device.manufacturer, "Fronius");
        assert_eq!(device.device_type, DeviceType::SolarInverter);

        let requests = bus.requests("SIM0");
        let at_9600: Vec<u8> = requests.iter().filter(|r| r.baud_rate == 9600).map(|r| r.unit_id).collect();
        let at_19200: Vec<u8> = requests.iter().filter(|r| r.baud_rate == 19_200).map(|r| r.unit_id).collect();
        assert_eq!(at_9600, (1..=10).collect::<Vec<u8>>());
        assert_eq!(at_19200, vec![1, 2, 3]);
        assert!(requests.iter().all(|r| r.baud_rate <= 19_200));

        // left open for polling
        assert!(ports.is_open("SIM0"));
        assert_eq!(log.list().len(), 1);
    }

    #[tokio::test]
    async fn test_registered_port_is_not_probed() {
        let bus = SimulatedBus::new();
        bus.add_device("SIM0", SimulatedDevice::new(9600, 1));
        let (engine, _, registry, log) = engine(&bus);
        registry.add("manual", DeviceConfig::serial("SIM0", 9600, 1)).unwrap();

        let first = engine.scan_ports(&["SIM0".to_string()]).await;
        let second = engine.scan_ports(&["SIM0".to_string()]).await;

        assert!(first.devices_found.is_empty() && second.devices_found.is_empty());
        assert_eq!(second.ports_skipped, 1);
        assert!(bus.requests("SIM0").is_empty());
        assert_eq!(registry.len(), 1);
        assert!(log.list().is_empty());
    }

    #[tokio::test]
    async fn test_rediscovery_is_skipped() {
        let bus = SimulatedBus::new();
        bus.add_device("SIM0", SimulatedDevice::new(9600, 2));
        let (engine, _, _, log) = engine(&bus);

        assert_eq!(engine.scan_ports(&["SIM0".to_string()]).await.devices_found.len(), 1);
        let requests_after_first = bus.requests("SIM0").len();
        assert!(engine.scan_ports(&["SIM0".to_string()]).await.devices_found.is_empty());
        assert_eq!(bus.requests("SIM0").len(), requests_after_first);
        assert_eq!(log.list().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupted_crc_is_never_discovered() {
        let bus = SimulatedBus::new();
        bus.add_device(
            "SIM0",
            SimulatedDevice::new(9600, 1).with_default_reply(Reply::CorruptCrc),
        );
        let (engine, ports, _, log) = engine(&bus);

        let summary = engine.scan_ports(&["SIM0".to_string()]).await;
        assert!(summary.devices_found.is_empty());
        assert!(log.list().is_empty());
        assert!(!ports.is_open("SIM0"));
        assert_eq!(bus.open_link_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_port_is_skipped_not_fatal() {
        let bus = SimulatedBus::new();
        bus.mark_unavailable("SIM0");
        bus.add_device("SIM1", SimulatedDevice::new(57_600, 7));
        let (engine, _, _, log) = engine(&bus);

        let summary = engine.scan_all().await;
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.devices_found.len(), 1);
        assert_eq!(summary.devices_found[0].manufacturer, "Generic");
        assert_eq!(log.stats().discovery_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_moves_to_next_baud() {
        let bus = SimulatedBus::new();
        bus.add_device("SIM0", SimulatedDevice::new(19_200, 3));
        bus.stall_writes("SIM0", 9600);
        let (engine, ports, _, _) = engine(&bus);

        let summary = engine.scan_ports(&["SIM0".to_string()]).await;
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.devices_found.len(), 1);
        assert_eq!(summary.devices_found[0].baud_rate(), Some(19_200));

        let at_19200 = bus.requests("SIM0").iter().filter(|r| r.baud_rate == 19_200).count();
        assert_eq!(at_19200, 3);
        assert!(ports.is_open("SIM0"));
    }

    #[tokio::test]
    async fn test_silent_port_stays_unscanned() {
        let bus = SimulatedBus::new();
        bus.add_port("SIM0");
        let (mut engine, ports, _, _) = engine(&bus);
        engine.cfg.unit_ids = UnitRange { start: 1, end: 2 };

        let summary = engine.scan_ports(&["SIM0".to_string()]).await;
        assert!(summary.devices_found.is_empty());
        assert_eq!(bus.requests("SIM0").len(), 5 * 2);
        assert!(!ports.is_open("SIM0"));

        // tried again on the next pass
        engine.scan_ports(&["SIM0".to_string()]).await;
        assert_eq!(bus.requests("SIM0").len(), 2 * 5 * 2);
    }
}
