//! Field gateway: Modbus RTU/TCP device discovery, validation and
//! protocol plumbing for energy devices on RS-485 lines and the local network.

pub mod config;
pub mod controller;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod modbus;
pub mod polling;
pub mod registry;
pub mod telemetry;
pub mod transport;

pub use config::Config;
pub use controller::{Gateway, ScanScheduler};
pub use registry::DeviceRegistry;
