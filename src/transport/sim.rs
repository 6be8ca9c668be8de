//! In-memory RS-485 bus for tests and bench runs.
//!
//! Each simulated port carries any number of devices, each answering at one
//! baud rate and unit ID. Replies are produced when a request is written and
//! buffered for the next read.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

use super::{PortOpener, SerialLink, SerialSettings};
use crate::error::TransportError;
use crate::modbus::codec::{self, READ_HOLDING_REGISTERS, REQUEST_LEN};

/// What a device does with the next request addressed to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Valid,
    Silent,
    CorruptCrc,
}

#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub baud_rate: u32,
    pub unit_id: u8,
    registers: Vec<u16>,
    script: VecDeque<Reply>,
    default_reply: Reply,
    noise: Option<(f64, u64)>,
}

impl SimulatedDevice {
    pub fn new(baud_rate: u32, unit_id: u8) -> Self {
        Self {
            baud_rate,
            unit_id,
            registers: vec![0; 16],
            script: VecDeque::new(),
            default_reply: Reply::Valid,
            noise: None,
        }
    }

    /// Holding registers starting at address 0
    pub fn with_registers(mut self, registers: Vec<u16>) -> Self {
        self.registers = registers;
        self
    }

    /// Replies used, in order, before falling back to the default
    pub fn with_script(mut self, script: impl IntoIterator<Item = Reply>) -> Self {
        self.script = script.into_iter().collect();
        self
    }

    pub fn with_default_reply(mut self, reply: Reply) -> Self {
        self.default_reply = reply;
        self
    }

    /// Flip one random bit of a reply with `probability`, seeded for repeatability
    pub fn with_noise(mut self, probability: f64, seed: u64) -> Self {
        self.noise = Some((probability, seed));
        self
    }

    fn next_reply(&mut self) -> Reply {
        self.script.pop_front().unwrap_or(self.default_reply)
    }

    fn respond(&self, start: u16, quantity: u16) -> Vec<u8> {
        let registers: Vec<u16> = (0..quantity)
            .map(|i| {
                self.registers
                    .get(usize::from(start) + usize::from(i))
                    .copied()
                    .unwrap_or(0)
            })
            .collect();
        codec::encode_read_response(self.unit_id, &registers)
    }
}

/// One request seen on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRecord {
    pub baud_rate: u32,
    pub unit_id: u8,
}

struct SimDevice {
    device: SimulatedDevice,
    rng: Option<StdRng>,
}

#[derive(Default)]
struct SimPort {
    devices: Vec<SimDevice>,
    unavailable: bool,
    open: bool,
    inbound: VecDeque<u8>,
    requests: Vec<RequestRecord>,
    stalled_bauds: HashSet<u32>,
}

#[derive(Default)]
struct BusState {
    ports: HashMap<String, SimPort>,
    opens: usize,
}

#[derive(Default)]
struct BusInner {
    state: Mutex<BusState>,
    notify: Mutex<HashMap<String, Arc<Notify>>>,
}

impl BusInner {
    fn notifier(&self, port: &str) -> Arc<Notify> {
        Arc::clone(self.notify.lock().entry(port.to_string()).or_default())
    }
}

/// Shared simulated bus; clones refer to the same ports.
#[derive(Clone, Default)]
pub struct SimulatedBus {
    inner: Arc<BusInner>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_port(&self, port: &str) {
        self.inner
            .state
            .lock()
            .ports
            .entry(port.to_string())
            .or_default();
    }

    pub fn add_device(&self, port: &str, device: SimulatedDevice) {
        let rng = device.noise.map(|(_, seed)| StdRng::seed_from_u64(seed));
        self.inner
            .state
            .lock()
            .ports
            .entry(port.to_string())
            .or_default()
            .devices
            .push(SimDevice { device, rng });
    }

    /// Listed by enumeration but fails to open
    pub fn mark_unavailable(&self, port: &str) {
        self.inner
            .state
            .lock()
            .ports
            .entry(port.to_string())
            .or_default()
            .unavailable = true;
    }

    /// Writes at `baud_rate` on `port` never complete
    pub fn stall_writes(&self, port: &str, baud_rate: u32) {
        self.inner
            .state
            .lock()
            .ports
            .entry(port.to_string())
            .or_default()
            .stalled_bauds
            .insert(baud_rate);
    }

    /// Push unsolicited bytes onto a port's receive buffer
    pub fn inject(&self, port: &str, bytes: &[u8]) {
        if let Some(p) = self.inner.state.lock().ports.get_mut(port) {
            p.inbound.extend(bytes);
        }
        self.inner.notifier(port).notify_one();
    }

    pub fn requests(&self, port: &str) -> Vec<RequestRecord> {
        self.inner
            .state
            .lock()
            .ports
            .get(port)
            .map(|p| p.requests.clone())
            .unwrap_or_default()
    }

    pub fn open_link_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .ports
            .values()
            .filter(|p| p.open)
            .count()
    }

    pub fn total_opens(&self) -> usize {
        self.inner.state.lock().opens
    }
}

impl PortOpener for SimulatedBus {
    fn open(&self, settings: &SerialSettings) -> Result<Box<dyn SerialLink>, TransportError> {
        let mut state = self.inner.state.lock();
        let port = state
            .ports
            .get_mut(&settings.port)
            .ok_or_else(|| TransportError::PortUnavailable {
                port: settings.port.clone(),
                reason: "no such device".to_string(),
            })?;
        if port.unavailable || port.open {
            return Err(TransportError::PortUnavailable {
                port: settings.port.clone(),
                reason: "device busy".to_string(),
            });
        }
        port.open = true;
        port.inbound.clear();
        state.opens += 1;

        Ok(Box::new(SimulatedLink {
            port: settings.port.clone(),
            baud_rate: settings.baud_rate,
            inner: Arc::clone(&self.inner),
            notify: self.inner.notifier(&settings.port),
            open: true,
        }))
    }

    fn available_ports(&self) -> Result<Vec<String>, TransportError> {
        let mut ports: Vec<String> = self.inner.state.lock().ports.keys().cloned().collect();
        ports.sort();
        Ok(ports)
    }
}

struct SimulatedLink {
    port: String,
    baud_rate: u32,
    inner: Arc<BusInner>,
    notify: Arc<Notify>,
    open: bool,
}

impl SimulatedLink {
    fn is_stalled(&self) -> bool {
        self.inner
            .state
            .lock()
            .ports
            .get(&self.port)
            .is_some_and(|p| p.stalled_bauds.contains(&self.baud_rate))
    }

    fn handle_request(&self, bytes: &[u8]) {
        if bytes.len() != REQUEST_LEN || !codec::has_valid_crc(bytes) {
            return;
        }
        let unit_id = bytes[0];
        let function_code = bytes[1];
        let start = u16::from_be_bytes([bytes[2], bytes[3]]);
        let quantity = u16::from_be_bytes([bytes[4], bytes[5]]);

        let mut state = self.inner.state.lock();
        let Some(port) = state.ports.get_mut(&self.port) else {
            return;
        };
        port.requests.push(RequestRecord {
            baud_rate: self.baud_rate,
            unit_id,
        });
        if function_code != READ_HOLDING_REGISTERS {
            return;
        }

        let baud_rate = self.baud_rate;
        let Some(sim) = port
            .devices
            .iter_mut()
            .find(|d| d.device.baud_rate == baud_rate && d.device.unit_id == unit_id)
        else {
            return;
        };

        let mut frame = match sim.device.next_reply() {
            Reply::Silent => return,
            Reply::Valid => sim.device.respond(start, quantity),
            Reply::CorruptCrc => {
                let mut frame = sim.device.respond(start, quantity);
                if let Some(last) = frame.last_mut() {
                    *last ^= 0xFF;
                }
                frame
            }
        };
        if let (Some((probability, _)), Some(rng)) = (sim.device.noise, sim.rng.as_mut()) {
            if rng.gen_bool(probability.clamp(0.0, 1.0)) {
                let index = rng.gen_range(0..frame.len());
                frame[index] ^= 1 << rng.gen_range(0..8);
            }
        }

        port.inbound.extend(frame);
        drop(state);
        self.notify.notify_one();
    }
}

#[async_trait]
impl SerialLink for SimulatedLink {
    async fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        if !self.open {
            return Err(TransportError::Closed(self.port.clone()));
        }
        if self.is_stalled() {
            std::future::pending::<()>().await;
        }
        self.handle_request(bytes);
        Ok(bytes.len())
    }

    async fn read_chunk(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        loop {
            if !self.open {
                return Err(TransportError::Closed(self.port.clone()));
            }
            let notified = self.notify.notified();
            {
                let mut state = self.inner.state.lock();
                if let Some(port) = state.ports.get_mut(&self.port) {
                    if !port.inbound.is_empty() {
                        let n = max_bytes.min(port.inbound.len());
                        return Ok(port.inbound.drain(..n).collect());
                    }
                }
            }
            notified.await;
        }
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Some(port) = self.inner.state.lock().ports.get_mut(&self.port) {
            port.open = false;
            port.inbound.clear();
        }
    }
}

impl Drop for SimulatedLink {
    fn drop(&mut self) {
        self.close();
    }
}
