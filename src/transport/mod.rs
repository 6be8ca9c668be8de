//! Serial port lifecycle.
//!
//! [`PortManager`] owns the table of open ports. A [`PortHandle`] is the
//! exclusive lease on one port: reads and writes take `&mut self`, so a
//! port never has two concurrent readers. A handle can be parked back into
//! the manager with the line still open, and the next `open` of the same port
//! at the same baud rate picks the parked line up again.

pub mod native;
#[cfg(feature = "sim")]
pub mod sim;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::SerialFraming;
use crate::error::TransportError;
use crate::modbus::codec;

pub use native::NativeSerialOpener;

/// Shortest silence that ends a frame when its length cannot be derived.
const MIN_INTER_FRAME_GAP: Duration = Duration::from_millis(20);

/// Port names tried when the OS cannot enumerate serial devices.
pub const FALLBACK_PORTS: [&str; 4] = ["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyACM0", "/dev/ttyACM1"];

/// Line parameters for one open request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub framing: SerialFraming,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl SerialSettings {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            framing: SerialFraming::default(),
            read_timeout: Duration::from_millis(1000),
            write_timeout: Duration::from_millis(1000),
        }
    }

    pub fn with_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    pub fn with_framing(mut self, framing: SerialFraming) -> Self {
        self.framing = framing;
        self
    }
}

/// An open OS-level serial line.
#[async_trait]
pub trait SerialLink: Send {
    async fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Wait for at least one byte and return what is buffered, up to `max_bytes`.
    /// An empty result means end of stream.
    async fn read_chunk(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError>;

    fn close(&mut self);
}

/// Source of serial lines: the OS, or a simulated bus.
pub trait PortOpener: Send + Sync {
    fn open(&self, settings: &SerialSettings) -> Result<Box<dyn SerialLink>, TransportError>;

    fn available_ports(&self) -> Result<Vec<String>, TransportError>;
}

enum PortEntry {
    Leased { baud_rate: u32 },
    Parked { baud_rate: u32, link: Box<dyn SerialLink> },
}

type PortTable = Arc<Mutex<HashMap<String, PortEntry>>>;

/// Open-port table shared by every component that touches a serial line.
#[derive(Clone)]
pub struct PortManager {
    opener: Arc<dyn PortOpener>,
    table: PortTable,
    shutdown: CancellationToken,
    fallback_ports: Vec<String>,
}

impl PortManager {
    pub fn new(opener: Arc<dyn PortOpener>) -> Self {
        Self {
            opener,
            table: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            fallback_ports: FALLBACK_PORTS.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn with_fallback_ports(mut self, ports: Vec<String>) -> Self {
        self.fallback_ports = ports;
        self
    }

    /// Enumerate serial ports, falling back to the configured names.
    pub fn available_ports(&self) -> Vec<String> {
        match self.opener.available_ports() {
            Ok(ports) if !ports.is_empty() => ports,
            Ok(_) => {
                debug!("no serial ports enumerated, using fallback list");
                self.fallback_ports.clone()
            }
            Err(e) => {
                warn!(error = %e, "serial port enumeration failed, using fallback list");
                self.fallback_ports.clone()
            }
        }
    }

    /// Lease `settings.port`. Fails with `PortBusy` while another handle holds it.
    pub fn open(&self, settings: &SerialSettings) -> Result<PortHandle, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed(settings.port.clone()));
        }

        let parked = {
            let mut table = self.table.lock();
            if let Some(PortEntry::Leased { baud_rate }) = table.get(&settings.port) {
                debug!(port = %settings.port, leased_at = *baud_rate, "port busy");
                return Err(TransportError::PortBusy(settings.port.clone()));
            }
            table.insert(
                settings.port.clone(),
                PortEntry::Leased {
                    baud_rate: settings.baud_rate,
                },
            )
        };

        let link = match parked {
            Some(PortEntry::Parked { baud_rate, link }) if baud_rate == settings.baud_rate => {
                debug!(port = %settings.port, baud_rate, "reusing parked port");
                link
            }
            Some(PortEntry::Parked { mut link, baud_rate }) => {
                debug!(port = %settings.port, from = baud_rate, to = settings.baud_rate, "reopening parked port");
                link.close();
                self.open_link(settings)?
            }
            _ => self.open_link(settings)?,
        };

        Ok(PortHandle {
            settings: settings.clone(),
            link: Some(link),
            table: Arc::clone(&self.table),
            shutdown: self.shutdown.clone(),
        })
    }

    fn open_link(&self, settings: &SerialSettings) -> Result<Box<dyn SerialLink>, TransportError> {
        match self.opener.open(settings) {
            Ok(link) => {
                debug!(port = %settings.port, baud_rate = settings.baud_rate, "port opened");
                Ok(link)
            }
            Err(e) => {
                self.table.lock().remove(&settings.port);
                Err(e)
            }
        }
    }

    /// Whether a handle is leased or parked on `port`.
    pub fn is_open(&self, port: &str) -> bool {
        self.table.lock().contains_key(port)
    }

    pub fn open_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.table.lock().keys().cloned().collect();
        ports.sort();
        ports
    }

    /// Close a parked port. Leased ports are left to their holder.
    pub fn release(&self, port: &str) -> bool {
        let mut table = self.table.lock();
        if !matches!(table.get(port), Some(PortEntry::Parked { .. })) {
            return false;
        }
        if let Some(PortEntry::Parked { mut link, .. }) = table.remove(port) {
            link.close();
            debug!(port, "parked port released");
        }
        true
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel in-flight I/O, close parked ports and wait for leased handles to drop.
    ///
    /// Returns true when every port is closed before `grace` runs out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutdown.cancel();

        let deadline = Instant::now() + grace;
        loop {
            self.close_parked();
            let remaining = self.open_ports();
            if remaining.is_empty() {
                info!("all serial ports closed");
                return true;
            }
            if Instant::now() >= deadline {
                warn!(ports = ?remaining, "ports still leased after shutdown grace period");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn close_parked(&self) {
        let parked: Vec<(String, Box<dyn SerialLink>)> = {
            let mut table = self.table.lock();
            let ports: Vec<String> = table
                .iter()
                .filter(|(_, entry)| matches!(entry, PortEntry::Parked { .. }))
                .map(|(port, _)| port.clone())
                .collect();
            ports
                .into_iter()
                .filter_map(|port| match table.remove(&port) {
                    Some(PortEntry::Parked { link, .. }) => Some((port, link)),
                    _ => None,
                })
                .collect()
        };
        for (port, mut link) in parked {
            link.close();
            debug!(port = %port, "parked port closed");
        }
    }
}

/// Exclusive lease on one open serial port.
pub struct PortHandle {
    settings: SerialSettings,
    link: Option<Box<dyn SerialLink>>,
    table: PortTable,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortHandle")
            .field("port", &self.settings.port)
            .field("baud_rate", &self.settings.baud_rate)
            .field("open", &self.link.is_some())
            .finish()
    }
}

impl PortHandle {
    pub fn port(&self) -> &str {
        &self.settings.port
    }

    pub fn baud_rate(&self) -> u32 {
        self.settings.baud_rate
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let port = &self.settings.port;
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| TransportError::Closed(port.clone()))?;

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TransportError::Closed(port.clone())),
            result = timeout(self.settings.write_timeout, link.write(bytes)) => match result {
                Ok(written) => written,
                Err(_) => Err(TransportError::CommunicationTimeout {
                    port: port.clone(),
                    op: "write",
                }),
            },
        }
    }

    /// Read one frame of at most `max_bytes`, waiting up to `wait` for the
    /// first byte. Returns an empty vector when nothing arrives in time.
    pub async fn read(&mut self, max_bytes: usize, wait: Duration) -> Result<Vec<u8>, TransportError> {
        let port = &self.settings.port;
        let gap = codec::transmission_time(self.settings.baud_rate, 4).max(MIN_INTER_FRAME_GAP);
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| TransportError::Closed(port.clone()))?;

        let mut frame = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(TransportError::Closed(port.clone())),
            result = timeout(wait, link.read_chunk(max_bytes)) => match result {
                Ok(chunk) => chunk?,
                Err(_) => return Ok(Vec::new()),
            },
        };

        while frame.len() < max_bytes {
            if codec::expected_frame_len(&frame).is_some_and(|len| frame.len() >= len) {
                break;
            }
            match timeout(gap, link.read_chunk(max_bytes - frame.len())).await {
                Ok(Ok(chunk)) if !chunk.is_empty() => frame.extend_from_slice(&chunk),
                Ok(Err(e)) => return Err(e),
                _ => break,
            }
        }

        frame.truncate(max_bytes);
        Ok(frame)
    }

    /// Close the port. Calling it again is a no-op.
    pub fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
            self.table.lock().remove(&self.settings.port);
            debug!(port = %self.settings.port, "port closed");
        }
    }

    /// Hand the still-open line back to the manager for the next lease.
    pub fn park(mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        if self.shutdown.is_cancelled() {
            self.link = Some(link);
            self.close();
            return;
        }
        self.table.lock().insert(
            self.settings.port.clone(),
            PortEntry::Parked {
                baud_rate: self.settings.baud_rate,
                link,
            },
        );
        debug!(port = %self.settings.port, "port parked");
    }

    /// Move the handle into a dedicated reader task.
    ///
    /// Frames are delivered through the returned listener until the manager
    /// shuts down, the line fails, or the listener is dropped. The port is
    /// closed when the task ends.
    pub fn into_listener(mut self, capacity: usize, max_frame: usize) -> PortListener {
        let (tx, frames) = mpsc::channel(capacity.max(1));
        let port = self.settings.port.clone();
        let idle = self.settings.read_timeout;

        let task = tokio::spawn(async move {
            loop {
                if tx.is_closed() {
                    break;
                }
                match self.read(max_frame, idle).await {
                    Ok(bytes) if bytes.is_empty() => continue,
                    Ok(bytes) => {
                        let frame = PortFrame {
                            port: self.settings.port.clone(),
                            bytes,
                            received_at: Utc::now(),
                        };
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(TransportError::Closed(_)) => break,
                    Err(e) => {
                        warn!(port = %self.settings.port, error = %e, "reader stopped");
                        break;
                    }
                }
            }
            self.close();
        });

        PortListener { port, frames, task }
    }
}

impl Drop for PortHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bytes received on a monitored port
#[derive(Debug, Clone)]
pub struct PortFrame {
    pub port: String,
    pub bytes: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Receiving end of a port's reader task
pub struct PortListener {
    port: String,
    frames: mpsc::Receiver<PortFrame>,
    task: JoinHandle<()>,
}

impl PortListener {
    pub fn port(&self) -> &str {
        &self.port
    }

    pub async fn recv(&mut self) -> Option<PortFrame> {
        self.frames.recv().await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the reader and wait for it to close the port.
    pub async fn stop(self) {
        let PortListener { frames, task, .. } = self;
        drop(frames);
        task.abort();
        let _ = task.await;
    }
}
