use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{PollingState, RegisterReader};
use crate::config::PollingConfig;
use crate::domain::{DeviceConfig, DeviceReading, DeviceType};

/// Result of one sustained polling run
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PollingOutcome {
    pub attempts: u32,
    pub successes: u32,
    pub success_rate: f64,
    pub state: PollingState,
}

/// Outcome of a full staged device test
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub target: String,
    pub device_type: DeviceType,
    pub manufacturer: String,
    pub model: String,
    pub port_available: bool,
    pub protocol_responds: bool,
    pub data_parses: bool,
    pub sustained_polling: bool,
    pub success: bool,
    pub readings_collected: usize,
    /// Samples taken during the data stage
    pub readings: Vec<DeviceReading>,
    pub success_rate: f64,
    pub polling_state: PollingState,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TestResult {
    fn begin(target: &str, config: &DeviceConfig) -> Self {
        let now = Utc::now();
        Self {
            target: target.to_string(),
            device_type: config.device_type,
            manufacturer: config.manufacturer.clone(),
            model: config.model.clone(),
            port_available: false,
            protocol_responds: false,
            data_parses: false,
            sustained_polling: false,
            success: false,
            readings_collected: 0,
            readings: Vec::new(),
            success_rate: 0.0,
            polling_state: PollingState::NotStarted,
            error_message: None,
            started_at: now,
            finished_at: now,
        }
    }

    /// Result for a device that cannot be tested at all
    pub fn not_testable(target: &str, config: &DeviceConfig, reason: impl Into<String>) -> Self {
        Self::begin(target, config).fail(reason)
    }

    fn fail(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        warn!(device_id = %self.target, error = %message, "device test failed");
        self.success = false;
        self.error_message = Some(message);
        self.finished_at = Utc::now();
        self
    }

    fn pass(mut self) -> Self {
        info!(device_id = %self.target, success_rate = self.success_rate, "device test passed");
        self.success = true;
        self.finished_at = Utc::now();
        self
    }
}

/// Polls a device repeatedly and gates it on the fraction of good reads.
///
/// Each target has its own [`PollingState`], observable through
/// [`ContinuousPollingTester::subscribe`].
pub struct ContinuousPollingTester {
    cfg: PollingConfig,
    states: Mutex<HashMap<String, Arc<watch::Sender<PollingState>>>>,
    shutdown: CancellationToken,
}

impl ContinuousPollingTester {
    pub fn new(cfg: PollingConfig, shutdown: CancellationToken) -> Self {
        Self {
            cfg,
            states: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    fn sender(&self, target: &str) -> Arc<watch::Sender<PollingState>> {
        Arc::clone(
            self.states
                .lock()
                .entry(target.to_string())
                .or_insert_with(|| Arc::new(watch::channel(PollingState::NotStarted).0)),
        )
    }

    pub fn subscribe(&self, target: &str) -> watch::Receiver<PollingState> {
        self.sender(target).subscribe()
    }

    pub fn state(&self, target: &str) -> PollingState {
        self.states
            .lock()
            .get(target)
            .map(|tx| *tx.borrow())
            .unwrap_or(PollingState::NotStarted)
    }

    fn period(&self) -> Duration {
        self.cfg.interval().max(Duration::from_millis(1))
    }

    /// Polling attempts per sustained run: `window / interval`, at least one.
    pub fn attempts(&self) -> u32 {
        let attempts = self.cfg.window().as_millis() / self.period().as_millis();
        u32::try_from(attempts).unwrap_or(u32::MAX).max(1)
    }

    /// Read `count` registers from `start` once per interval over the window.
    ///
    /// Attempts cut short by shutdown count as failures.
    pub async fn poll_continuously(&self, reader: &dyn RegisterReader, start: u16, count: u16) -> PollingOutcome {
        let state = self.sender(reader.target());
        state.send_replace(PollingState::Running);

        let attempts = self.attempts();
        let mut successes = 0u32;
        let mut ticker = interval(self.period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for attempt in 1..=attempts {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!(device_id = reader.target(), attempt, "polling interrupted by shutdown");
                    break;
                }
                _ = ticker.tick() => {}
            }

            match reader.read_registers(start, count).await {
                Ok(_) => successes += 1,
                Err(e) => debug!(device_id = reader.target(), attempt, error = %e, "poll failed"),
            }
        }

        let success_rate = f64::from(successes) / f64::from(attempts);
        let outcome = if success_rate >= self.cfg.success_threshold {
            PollingState::Passed
        } else {
            PollingState::Failed
        };
        state.send_replace(outcome);

        info!(
            device_id = reader.target(),
            attempts,
            successes,
            success_rate,
            state = %outcome,
            "sustained polling finished"
        );
        PollingOutcome {
            attempts,
            successes,
            success_rate,
            state: outcome,
        }
    }

    async fn collect_readings(&self, reader: &dyn RegisterReader, config: &DeviceConfig) -> Vec<DeviceReading> {
        let mut readings = Vec::new();
        for sample in 0..self.cfg.readings_samples {
            if sample > 0 {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = sleep(self.cfg.sample_interval()) => {}
                }
            }
            match reader
                .read_registers(config.start_address, config.register_count)
                .await
            {
                Ok(registers) => readings.push(DeviceReading::new(
                    reader.target(),
                    config.unit_id,
                    config.start_address,
                    registers,
                )),
                Err(e) => debug!(device_id = reader.target(), sample, error = %e, "sample read failed"),
            }
        }
        readings
    }

    /// Run every stage against one device, stopping at the first failure.
    pub async fn run_test(&self, config: &DeviceConfig, reader: &dyn RegisterReader) -> TestResult {
        let mut result = TestResult::begin(reader.target(), config);
        info!(device_id = reader.target(), connection = %config.connection, "starting device test");

        result.port_available = reader.is_available().await;
        if !result.port_available {
            return result.fail(format!("Port not available: {}", config.connection));
        }

        if let Err(e) = reader
            .read_registers(config.start_address, config.register_count)
            .await
        {
            return result.fail(format!("Modbus communication failed: {e}"));
        }
        result.protocol_responds = true;

        let readings = self.collect_readings(reader, config).await;
        result.readings_collected = readings.len();
        result.data_parses =
            !readings.is_empty() && readings.iter().all(|r| r.is_complete(config.register_count));
        result.readings = readings.clone();
        if !result.data_parses {
            return result.fail(format!(
                "Data parsing failed: {} of {} samples read",
                readings.len(),
                self.cfg.readings_samples
            ));
        }

        let outcome = self
            .poll_continuously(reader, config.start_address, config.register_count)
            .await;
        result.success_rate = outcome.success_rate;
        result.polling_state = outcome.state;
        result.sustained_polling = outcome.state == PollingState::Passed;
        if !result.sustained_polling {
            return result.fail(format!(
                "Sustained polling failed: {:.1}% success rate",
                outcome.success_rate * 100.0
            ));
        }

        result.pass()
    }
}
