use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::DiscoveryLog;
use crate::config::NetworkConfig;
use crate::domain::{network_device_id, Connection, DeviceType, DiscoveredDevice, DiscoveryStatus, Protocol};

/// Smallest CIDR prefix accepted as a scan target
const MIN_CIDR_PREFIX: u32 = 16;

/// Reachability check for one socket address.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn probe(&self, addr: SocketAddr) -> bool;
}

/// Plain TCP connect with a timeout
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl NetworkProbe for TcpProbe {
    async fn probe(&self, addr: SocketAddr) -> bool {
        match timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => {
                debug!(%addr, "port open");
                true
            }
            Ok(Err(_)) | Err(_) => false,
        }
    }
}

/// Expand a scan target into host addresses.
///
/// Accepts a dotted prefix (`"192.168.1."`, hosts .1 to .254), CIDR notation
/// (`"192.168.1.0/24"`, network and broadcast excluded), a range
/// (`"192.168.1.1-192.168.1.10"`) or a single address.
pub fn parse_target(target: &str) -> Result<Vec<IpAddr>> {
    let target = target.trim();
    if target.ends_with('.') {
        parse_prefix(target)
    } else if target.contains('/') {
        parse_cidr(target)
    } else if target.contains('-') {
        parse_range(target)
    } else {
        Ok(vec![target.parse()?])
    }
}

fn parse_prefix(prefix: &str) -> Result<Vec<IpAddr>> {
    let octets: Vec<u8> = prefix
        .trim_end_matches('.')
        .split('.')
        .map(str::parse)
        .collect::<Result<_, _>>()?;
    let &[a, b, c] = octets.as_slice() else {
        bail!("Invalid prefix {prefix}: expected three octets");
    };
    Ok((1..=254)
        .map(|d| IpAddr::V4(Ipv4Addr::new(a, b, c, d)))
        .collect())
}

fn parse_cidr(cidr: &str) -> Result<Vec<IpAddr>> {
    let Some((base, prefix_len)) = cidr.split_once('/') else {
        bail!("Invalid CIDR notation");
    };
    let base_ip: IpAddr = base.trim().parse()?;
    let prefix_len: u32 = prefix_len.trim().parse()?;

    let IpAddr::V4(ipv4) = base_ip else {
        bail!("IPv6 CIDR ranges not supported");
    };
    if prefix_len > 32 {
        bail!("Invalid CIDR prefix length {prefix_len}");
    }
    if prefix_len < MIN_CIDR_PREFIX {
        bail!("CIDR {cidr} is too large to scan (minimum prefix /{MIN_CIDR_PREFIX})");
    }
    if prefix_len >= 31 {
        return Ok(vec![IpAddr::V4(ipv4)]);
    }

    let mask = u32::MAX << (32 - prefix_len);
    let network = u32::from(ipv4) & mask;
    let broadcast = network | !mask;
    Ok(((network + 1)..broadcast).map(|i| IpAddr::V4(i.into())).collect())
}

fn parse_range(range: &str) -> Result<Vec<IpAddr>> {
    let Some((start, end)) = range.split_once('-') else {
        bail!("Invalid range notation");
    };
    let start_ip: IpAddr = start.trim().parse()?;
    let end_ip: IpAddr = end.trim().parse()?;

    match (start_ip, end_ip) {
        (IpAddr::V4(start), IpAddr::V4(end)) => {
            let (start, end) = (u32::from(start), u32::from(end));
            if start > end {
                bail!("Start IP must be less than or equal to end IP");
            }
            Ok((start..=end).map(|i| IpAddr::V4(i.into())).collect())
        }
        _ => bail!("Only IPv4 ranges are supported"),
    }
}

/// Outcome of one network pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkScanSummary {
    pub hosts_probed: usize,
    /// Every host that accepted a connection this pass
    pub devices_found: Vec<DiscoveredDevice>,
    pub new_devices: usize,
    pub went_offline: Vec<String>,
    pub errors: usize,
}

/// Finds Modbus-TCP endpoints by connecting to the Modbus port across the
/// configured address ranges.
pub struct NetworkDiscoveryEngine {
    probe: Arc<dyn NetworkProbe>,
    log: Arc<DiscoveryLog>,
    cfg: NetworkConfig,
    shutdown: CancellationToken,
}

impl NetworkDiscoveryEngine {
    pub fn new(
        probe: Arc<dyn NetworkProbe>,
        log: Arc<DiscoveryLog>,
        cfg: NetworkConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            probe,
            log,
            cfg,
            shutdown,
        }
    }

    pub async fn scan(&self) -> NetworkScanSummary {
        let mut summary = NetworkScanSummary::default();

        let mut hosts = BTreeSet::new();
        for target in &self.cfg.targets {
            match parse_target(target) {
                Ok(ips) => hosts.extend(ips),
                Err(e) => {
                    summary.errors += 1;
                    warn!(scan_target = %target, error = %e, "invalid scan target");
                }
            }
        }
        let hosts: Vec<IpAddr> = hosts.into_iter().collect();
        info!(hosts = hosts.len(), port = self.cfg.modbus_port, "scanning for Modbus-TCP devices");

        for batch in hosts.chunks(self.cfg.concurrent_probes.max(1)) {
            if self.shutdown.is_cancelled() {
                debug!("network scan interrupted by shutdown");
                break;
            }

            let handles: Vec<_> = batch
                .iter()
                .map(|&ip| {
                    let probe = Arc::clone(&self.probe);
                    let addr = SocketAddr::new(ip, self.cfg.modbus_port);
                    tokio::spawn(async move {
                        let started = Instant::now();
                        let open = probe.probe(addr).await;
                        (ip, open, started.elapsed())
                    })
                })
                .collect();

            for joined in join_all(handles).await {
                summary.hosts_probed += 1;
                match joined {
                    Ok((ip, true, latency)) => {
                        let device = self.discovered(ip, latency);
                        if self.log.record(device.clone()) {
                            summary.new_devices += 1;
                            info!(device_id = %device.device_id, host = %ip, "network device discovered");
                        }
                        summary.devices_found.push(device);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        summary.errors += 1;
                        warn!(error = %e, "probe task failed");
                    }
                }
            }
        }

        summary.went_offline = self.log.mark_offline(
            Protocol::ModbusTcp,
            Duration::from_secs(self.cfg.offline_after_secs),
            Utc::now(),
        );
        for device_id in &summary.went_offline {
            info!(device_id = %device_id, "network device offline");
        }

        self.log.record_scan(summary.errors as u64);
        info!(
            probed = summary.hosts_probed,
            responding = summary.devices_found.len(),
            new = summary.new_devices,
            offline = summary.went_offline.len(),
            "network discovery pass complete"
        );
        summary
    }

    fn discovered(&self, host: IpAddr, latency: Duration) -> DiscoveredDevice {
        let now = Utc::now();
        DiscoveredDevice {
            device_id: network_device_id(host),
            device_type: DeviceType::GenericModbus,
            protocol: Protocol::ModbusTcp,
            connection: Connection::Tcp {
                host,
                port: self.cfg.modbus_port,
            },
            unit_id: 1,
            manufacturer: "Generic".to_string(),
            model: "Modbus TCP Device".to_string(),
            status: DiscoveryStatus::Discovered,
            discovered_at: now,
            last_seen: now,
            response_latency_ms: Some(latency.as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_single_ip() {
        let ips = parse_target("192.168.1.1").unwrap();
        assert_eq!(ips, vec!["192.168.1.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_parse_prefix() {
        let ips = parse_target("10.0.0.").unwrap();
        assert_eq!(ips.len(), 254);
        assert_eq!(ips[0], "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(ips[253], "10.0.0.254".parse::<IpAddr>().unwrap());
        assert!(parse_target("10.0.").is_err());
        assert!(parse_target("10.0.300.").is_err());
    }

    #[test]
    fn test_parse_range() {
        let ips = parse_target("192.168.1.1-192.168.1.5").unwrap();
        assert_eq!(ips.len(), 5);
        assert!(parse_target("192.168.1.5-192.168.1.1").is_err());
    }

    #[test]
    fn test_parse_cidr() {
        let ips = parse_target("192.168.1.0/30").unwrap();
        assert_eq!(ips.len(), 2); // .1 and .2 (excluding network and broadcast)
        assert_eq!(parse_target("192.168.1.0/24").unwrap().len(), 254);
        assert_eq!(parse_target("192.168.1.9/32").unwrap().len(), 1);
        assert!(parse_target("10.0.0.0/8").is_err());
        assert!(parse_target("10.0.0.0/33").is_err());
    }

    fn config(targets: &[&str], batch: usize) -> NetworkConfig {
        NetworkConfig {
            targets: targets.iter().map(|t| t.to_string()).collect(),
            concurrent_probes: batch,
            ..NetworkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_scan_records_responders_once() {
        let mut probe = MockNetworkProbe::new();
        probe
            .expect_probe()
            .times(20)
            .returning(|addr| addr.port() == 502 && addr.ip() == "10.0.0.5".parse::<IpAddr>().unwrap());

        let log = Arc::new(DiscoveryLog::new());
        let engine = NetworkDiscoveryEngine::new(
            Arc::new(probe),
            log.clone(),
            config(&["10.0.0.1-10.0.0.10", "not-an-ip"], 3),
            CancellationToken::new(),
        );

        let first = engine.scan().await;
        assert_eq!(first.hosts_probed, 10);
        assert_eq!(first.errors, 1);
        assert_eq!(first.new_devices, 1);

        let device = &first.devices_found[0];
        assert_eq!(device.device_id, "network_10_0_0_5");
        assert_eq!(device.protocol, Protocol::ModbusTcp);
        assert_eq!(device.unit_id, 1);
        assert_eq!(device.manufacturer, "Generic");

        let second = engine.scan().await;
        assert_eq!(second.devices_found.len(), 1);
        assert_eq!(second.new_devices, 0);
        assert_eq!(log.list().len(), 1);
        assert_eq!(log.stats().scan_cycles, 2);
    }

    #[tokio::test]
    async fn test_overlapping_targets_probe_each_host_once() {
        let mut probe = MockNetworkProbe::new();
        probe.expect_probe().times(4).returning(|_| false);

        let engine = NetworkDiscoveryEngine::new(
            Arc::new(probe),
            Arc::new(DiscoveryLog::new()),
            config(&["10.0.0.1-10.0.0.3", "10.0.0.2-10.0.0.4"], 64),
            CancellationToken::new(),
        );
        let summary = engine.scan().await;
        assert_eq!(summary.hosts_probed, 4);
        assert!(summary.devices_found.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_scan_probes_nothing() {
        let mut probe = MockNetworkProbe::new();
        probe.expect_probe().never();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let engine = NetworkDiscoveryEngine::new(
            Arc::new(probe),
            Arc::new(DiscoveryLog::new()),
            config(&["10.0.0."], 16),
            shutdown,
        );
        assert_eq!(engine.scan().await.hosts_probed, 0);
    }

    #[tokio::test]
    async fn test_tcp_probe_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap();

        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let probe = TcpProbe::new(Duration::from_millis(500));
        assert!(probe.probe(open).await);
        assert!(!probe.probe(closed).await);
    }
}
