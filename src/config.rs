use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::domain::DeviceConfig;

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub polling: PollingConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
    /// Statically configured devices keyed by device ID
    pub devices: BTreeMap<String, DeviceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRange {
    pub start: u8,
    pub end: u8,
}

impl UnitRange {
    pub fn ids(&self) -> std::ops::RangeInclusive<u8> {
        self.start..=self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port names used when enumeration finds nothing
    pub ports: Vec<String>,
    pub baud_rates: Vec<u32>,
    pub unit_ids: UnitRange,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub settle_delay_ms: u64,
    /// Stretch the settle delay to cover slow lines and large reads
    pub scale_settle_delay: bool,
    pub read_buffer: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            ports: crate::transport::FALLBACK_PORTS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            baud_rates: vec![9600, 19_200, 38_400, 57_600, 115_200],
            unit_ids: UnitRange { start: 1, end: 10 },
            read_timeout_ms: 1000,
            write_timeout_ms: 1000,
            settle_delay_ms: 200,
            scale_settle_delay: true,
            read_buffer: 256,
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Wait after writing a request of `quantity` registers at `baud_rate`
    pub fn settle_delay(&self, baud_rate: u32, quantity: u16) -> Duration {
        let floor = Duration::from_millis(self.settle_delay_ms);
        if self.scale_settle_delay {
            crate::modbus::settle_delay(baud_rate, quantity, floor)
        } else {
            floor
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub enabled: bool,
    /// Dotted prefixes ("192.168.1."), CIDR blocks or "a-b" ranges
    pub targets: Vec<String>,
    pub modbus_port: u16,
    pub connect_timeout_ms: u64,
    pub concurrent_probes: usize,
    /// Network devices not seen for this long are marked offline
    pub offline_after_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            targets: vec![
                "192.168.1.".to_string(),
                "192.168.0.".to_string(),
                "10.0.0.".to_string(),
                "172.16.0.".to_string(),
            ],
            modbus_port: crate::domain::MODBUS_TCP_PORT,
            connect_timeout_ms: 1000,
            concurrent_probes: 64,
            offline_after_secs: 300,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub serial_enabled: bool,
    /// Promote discoveries into the registry without operator action
    pub auto_register: bool,
    /// Registers read when a discovered device is promoted
    pub register_count: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            serial_enabled: true,
            auto_register: true,
            register_count: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub window_secs: u64,
    pub interval_secs: u64,
    pub success_threshold: f64,
    /// Reads taken by the data-parse stage
    pub readings_samples: u32,
    pub sample_interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            window_secs: 30,
            interval_secs: 2,
            success_threshold: 0.8,
            readings_samples: 5,
            sample_interval_ms: 1000,
        }
    }
}

impl PollingConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub worker_pool_size: usize,
    pub serial_scan_delay_secs: u64,
    pub serial_scan_interval_secs: u64,
    pub network_scan_delay_secs: u64,
    pub network_scan_interval_secs: u64,
    pub validation_delay_secs: u64,
    pub validation_interval_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            serial_scan_delay_secs: 5,
            serial_scan_interval_secs: 30,
            network_scan_delay_secs: 10,
            network_scan_interval_secs: 60,
            validation_delay_secs: 15,
            validation_interval_secs: 120,
            shutdown_grace_secs: 5,
        }
    }
}

impl SchedulerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
    /// Also write daily-rotated logs into this directory
    pub directory: Option<String>,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,tokio_modbus=warn".to_string(),
            format: LogFormat::Json,
            directory: None,
            file_prefix: "field-gateway.log".to_string(),
        }
    }
}

impl Config {
    /// Load `config/default.toml` (or `$GATEWAY_CONFIG`) plus `GATEWAY__*` overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("GATEWAY__").split("__"));
        let cfg: Config = figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let serial = &self.serial;
        if serial.baud_rates.is_empty() {
            bail!("serial.baud_rates must not be empty");
        }
        if serial.baud_rates.windows(2).any(|w| w[0] >= w[1]) {
            bail!("serial.baud_rates must be strictly ascending");
        }
        if serial.unit_ids.start == 0 || serial.unit_ids.end > 247 || serial.unit_ids.start > serial.unit_ids.end {
            bail!(
                "serial.unit_ids {}..={} must lie within 1..=247",
                serial.unit_ids.start,
                serial.unit_ids.end
            );
        }
        if serial.read_buffer == 0 {
            bail!("serial.read_buffer must be positive");
        }
        if !(self.polling.success_threshold > 0.0 && self.polling.success_threshold <= 1.0) {
            bail!("polling.success_threshold must be in (0, 1]");
        }
        if self.polling.interval_secs == 0 || self.polling.window_secs == 0 {
            bail!("polling window and interval must be positive");
        }
        if !(1..=125).contains(&self.discovery.register_count) {
            bail!("discovery.register_count must be within 1..=125");
        }
        let sched = &self.scheduler;
        if sched.worker_pool_size == 0
            || sched.serial_scan_interval_secs == 0
            || sched.network_scan_interval_secs == 0
            || sched.validation_interval_secs == 0
        {
            bail!("scheduler intervals and worker_pool_size must be positive");
        }
        if self.network.concurrent_probes == 0 {
            bail!("network.concurrent_probes must be positive");
        }
        for (id, device) in &self.devices {
            device
                .check()
                .with_context(|| format!("device {id} is misconfigured"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.serial.baud_rates, vec![9600, 19_200, 38_400, 57_600, 115_200]);
        assert_eq!(cfg.serial.unit_ids.ids().count(), 10);
        assert_eq!(cfg.polling.success_threshold, 0.8);
        assert_eq!(cfg.scheduler.worker_pool_size, 4);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[serial]
baud_rates = [9600, 19200]
settle_delay_ms = 50

[polling]
window_secs = 10

[devices.meter_1]
unit_id = 4
connection = {{ kind = "serial", port = "/dev/ttyUSB1", baud_rate = 9600 }}
"#
        )
        .unwrap();

        let cfg = Config::load_from(file.path()).unwrap();
        assert_eq!(cfg.serial.baud_rates, vec![9600, 19_200]);
        assert_eq!(cfg.serial.settle_delay_ms, 50);
        assert_eq!(cfg.serial.read_timeout_ms, 1000);
        assert_eq!(cfg.polling.window_secs, 10);
        assert_eq!(cfg.devices["meter_1"].unit_id, 4);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cfg = Config::load_from("does/not/exist.toml").unwrap();
        assert_eq!(cfg.network.modbus_port, 502);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.serial.baud_rates = vec![19_200, 9600];
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.serial.unit_ids = UnitRange { start: 0, end: 10 };
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.polling.success_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.devices.insert("bad".into(), DeviceConfig::serial("/dev/ttyUSB0", 9600, 0));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_settle_delay_modes() {
        let mut serial = SerialConfig::default();
        assert_eq!(serial.settle_delay(9600, 1), Duration::from_millis(200));
        assert!(serial.settle_delay(9600, 125) > Duration::from_millis(200));
        serial.scale_settle_delay = false;
        assert_eq!(serial.settle_delay(9600, 125), Duration::from_millis(200));
    }
}
