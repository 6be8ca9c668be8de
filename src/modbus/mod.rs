pub mod codec;
pub mod parser;

#[cfg(feature = "modbus")]
pub mod client;

pub use codec::{
    build_read_request, crc16, decode_read_response, encode_read_response, settle_delay,
    validate_response, READ_HOLDING_REGISTERS,
};

#[cfg(feature = "modbus")]
pub use client::ModbusTcpClient;
