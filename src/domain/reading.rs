use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::modbus::parser;

/// Register block read from a device in one exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    pub device_id: String,
    pub unit_id: u8,
    pub start_address: u16,
    pub registers: Vec<u16>,
    pub timestamp: DateTime<Utc>,
}

impl DeviceReading {
    pub fn new(device_id: impl Into<String>, unit_id: u8, start_address: u16, registers: Vec<u16>) -> Self {
        Self {
            device_id: device_id.into(),
            unit_id,
            start_address,
            registers,
            timestamp: Utc::now(),
        }
    }

    fn tail(&self, offset: usize) -> &[u16] {
        self.registers.get(offset..).unwrap_or(&[])
    }

    pub fn u16_at(&self, offset: usize) -> Option<u16> {
        parser::parse_u16(self.tail(offset))
    }

    pub fn i16_at(&self, offset: usize) -> Option<i16> {
        parser::parse_i16(self.tail(offset))
    }

    pub fn u32_at(&self, offset: usize) -> Option<u32> {
        parser::parse_u32(self.tail(offset))
    }

    pub fn i32_at(&self, offset: usize) -> Option<i32> {
        parser::parse_i32(self.tail(offset))
    }

    pub fn f32_at(&self, offset: usize) -> Option<f32> {
        parser::parse_f32(self.tail(offset))
    }

    pub fn scaled_at(&self, offset: usize, scale: f64) -> Option<f64> {
        parser::parse_scaled(self.tail(offset), scale)
    }

    /// Whether the block has the expected shape
    pub fn is_complete(&self, expected_registers: u16) -> bool {
        self.registers.len() == usize::from(expected_registers)
    }
}
