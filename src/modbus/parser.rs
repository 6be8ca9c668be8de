//! Generic register decoding. Multi-register values are big-endian word order.

use byteorder::{BigEndian, ByteOrder};

/// Parse u16 from the first register
pub fn parse_u16(registers: &[u16]) -> Option<u16> {
    registers.first().copied()
}

/// Parse i16 from the first register
pub fn parse_i16(registers: &[u16]) -> Option<i16> {
    parse_u16(registers).map(|r| r as i16)
}

/// Parse u32 from two registers (high word first)
pub fn parse_u32(registers: &[u16]) -> Option<u32> {
    match registers {
        [hi, lo, ..] => Some((u32::from(*hi) << 16) | u32::from(*lo)),
        _ => None,
    }
}

/// Parse i32 from two registers (high word first)
pub fn parse_i32(registers: &[u16]) -> Option<i32> {
    parse_u32(registers).map(|v| v as i32)
}

/// Parse f32 from two registers (IEEE 754)
pub fn parse_f32(registers: &[u16]) -> Option<f32> {
    let [hi, lo] = match registers {
        [hi, lo, ..] => [*hi, *lo],
        _ => return None,
    };
    let mut bytes = [0u8; 4];
    BigEndian::write_u16(&mut bytes[..2], hi);
    BigEndian::write_u16(&mut bytes[2..], lo);
    Some(BigEndian::read_f32(&bytes))
}

/// Signed register value times `scale`
pub fn parse_scaled(registers: &[u16], scale: f64) -> Option<f64> {
    parse_i16(registers).map(|raw| f64::from(raw) * scale)
}

/// Flatten registers into their wire bytes
pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    let mut bytes = vec![0u8; registers.len() * 2];
    BigEndian::write_u16_into(registers, &mut bytes);
    bytes
}
