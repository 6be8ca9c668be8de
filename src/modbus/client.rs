use anyhow::{Context as AnyhowContext, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_RETRIES: u32 = 1;

/// Modbus-TCP (MBAP) client for a single unit behind one socket address.
#[derive(Clone)]
pub struct ModbusTcpClient {
    context: Arc<Mutex<tokio_modbus::client::Context>>,
    unit_id: u8,
    addr: SocketAddr,
    timeout_duration: Duration,
    max_attempts: u32,
}

impl ModbusTcpClient {
    pub async fn connect(addr: SocketAddr, unit_id: u8) -> Result<Self> {
        Self::connect_with_timeout(addr, unit_id, DEFAULT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        addr: SocketAddr,
        unit_id: u8,
        timeout_duration: Duration,
    ) -> Result<Self> {
        debug!(%addr, unit_id, "connecting to Modbus-TCP device");

        let ctx = timeout(timeout_duration, tcp::connect_slave(addr, Slave(unit_id)))
            .await
            .context("Connection timeout")?
            .context("Failed to connect")?;

        Ok(Self {
            context: Arc::new(Mutex::new(ctx)),
            unit_id,
            addr,
            timeout_duration,
            max_attempts: DEFAULT_RETRIES,
        })
    }

    /// Total attempts per operation, including the first.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn read_holding_registers(&self, start: u16, count: u16) -> Result<Vec<u16>> {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            let mut ctx = self.context.lock().await;
            ctx.set_slave(Slave(self.unit_id));

            match timeout(self.timeout_duration, ctx.read_holding_registers(start, count)).await {
                Ok(Ok(registers)) => {
                    if attempt > 1 {
                        debug!(attempt, "Modbus read succeeded after retry");
                    }
                    return Ok(registers);
                }
                Ok(Err(e)) => {
                    warn!(addr = %self.addr, attempt, error = %e, "Modbus read failed");
                    last_error = Some(anyhow::Error::new(e));
                }
                Err(_) => {
                    warn!(addr = %self.addr, attempt, "Modbus read timeout");
                    last_error = Some(anyhow::anyhow!("timeout after {:?}", self.timeout_duration));
                }
            }

            drop(ctx);
            if attempt < self.max_attempts {
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("no attempts made"))
            .context(format!(
                "Failed to read holding registers at {start} from {} after {} attempts",
                self.addr, self.max_attempts
            )))
    }

    /// One valid request/response exchange; required before a network device is trusted.
    pub async fn health_check(&self) -> Result<()> {
        self.read_holding_registers(0, 1)
            .await
            .map(|_| ())
            .context("Health check failed")
    }
}
