//! Modbus RTU framing for the read-holding-registers exchange.
//!
//! Request: `[unit, fc, addrHi, addrLo, qtyHi, qtyLo, crcLo, crcHi]`
//! Response: `[unit, fc, byteCount, data.., crcLo, crcHi]`

use std::time::Duration;

use crate::error::{ConfigurationError, FrameError};

/// Read holding registers, the only function code the gateway speaks.
pub const READ_HOLDING_REGISTERS: u8 = 0x03;

pub const REQUEST_LEN: usize = 8;

/// Largest register block a single read may ask for.
pub const MAX_QUANTITY: u16 = 125;

const CRC_INIT: u16 = 0xFFFF;
const CRC_POLY: u16 = 0xA001;

/// 1 start + 8 data + parity/stop slot + 1 stop.
const BITS_PER_CHAR: u64 = 11;

/// CRC-16/MODBUS over `bytes`.
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc = CRC_INIT;
    for &byte in bytes {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC_POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Append the CRC of `frame` low byte first.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Whether the trailing two bytes are the CRC of everything before them.
pub fn has_valid_crc(frame: &[u8]) -> bool {
    match frame.len().checked_sub(2) {
        Some(split) if split > 0 => {
            let (body, trailer) = frame.split_at(split);
            crc16(body) == u16::from_le_bytes([trailer[0], trailer[1]])
        }
        _ => false,
    }
}

/// Build an 8-byte read request.
pub fn build_read_request(
    unit_id: u8,
    function_code: u8,
    start_address: u16,
    quantity: u16,
) -> [u8; REQUEST_LEN] {
    let [addr_hi, addr_lo] = start_address.to_be_bytes();
    let [qty_hi, qty_lo] = quantity.to_be_bytes();
    let mut frame = [unit_id, function_code, addr_hi, addr_lo, qty_hi, qty_lo, 0, 0];
    let [crc_lo, crc_hi] = crc16(&frame[..6]).to_le_bytes();
    frame[6] = crc_lo;
    frame[7] = crc_hi;
    frame
}

/// Checked variant used when the parameters come from configuration.
pub fn try_build_read_request(
    unit_id: u8,
    function_code: u8,
    start_address: u16,
    quantity: u16,
) -> Result<[u8; REQUEST_LEN], ConfigurationError> {
    if function_code != READ_HOLDING_REGISTERS {
        return Err(ConfigurationError::UnsupportedFunction(function_code));
    }
    if !(1..=247).contains(&unit_id) {
        return Err(ConfigurationError::Invalid(format!(
            "unit id {unit_id} outside 1..=247"
        )));
    }
    if quantity == 0 || quantity > MAX_QUANTITY {
        return Err(ConfigurationError::Invalid(format!(
            "register quantity {quantity} outside 1..={MAX_QUANTITY}"
        )));
    }
    Ok(build_read_request(
        unit_id,
        function_code,
        start_address,
        quantity,
    ))
}

/// Header and CRC checks, reporting the first one that fails.
pub fn check_response(bytes: &[u8], expected_unit_id: u8) -> Result<(), FrameError> {
    if bytes.len() < 4 {
        return Err(FrameError::TooShort(bytes.len()));
    }
    if bytes[0] != expected_unit_id || bytes[1] != READ_HOLDING_REGISTERS {
        return Err(FrameError::ProtocolMismatch {
            expected_unit: expected_unit_id,
            unit: bytes[0],
            function_code: bytes[1],
        });
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 2);
    let expected = crc16(body);
    let actual = u16::from_le_bytes([trailer[0], trailer[1]]);
    if expected != actual {
        return Err(FrameError::CrcValidationFailure { expected, actual });
    }
    Ok(())
}

/// True when `bytes` is a CRC-valid read response from `expected_unit_id`.
pub fn validate_response(bytes: &[u8], expected_unit_id: u8) -> bool {
    check_response(bytes, expected_unit_id).is_ok()
}

/// Validate a response and extract its registers (big-endian words).
pub fn decode_read_response(
    bytes: &[u8],
    expected_unit_id: u8,
    expected_quantity: u16,
) -> Result<Vec<u16>, FrameError> {
    check_response(bytes, expected_unit_id)?;
    if bytes.len() < 5 {
        return Err(FrameError::TooShort(bytes.len()));
    }

    let byte_count = usize::from(bytes[2]);
    let expected = usize::from(expected_quantity) * 2;
    if byte_count != expected {
        return Err(FrameError::ByteCountMismatch {
            expected,
            actual: byte_count,
        });
    }
    if bytes.len() != 3 + byte_count + 2 {
        return Err(FrameError::ByteCountMismatch {
            expected: 3 + byte_count + 2,
            actual: bytes.len(),
        });
    }

    Ok(bytes[3..3 + byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Encode a read response frame for `registers`.
///
/// Registers past [`MAX_QUANTITY`] do not fit one frame and are dropped.
pub fn encode_read_response(unit_id: u8, registers: &[u16]) -> Vec<u8> {
    let registers = &registers[..registers.len().min(usize::from(MAX_QUANTITY))];
    let mut frame = Vec::with_capacity(5 + registers.len() * 2);
    frame.push(unit_id);
    frame.push(READ_HOLDING_REGISTERS);
    frame.push((registers.len() * 2) as u8);
    frame.extend_from_slice(&super::parser::registers_to_bytes(registers));
    append_crc(&mut frame);
    frame
}

/// Total length of the frame starting with `frame`, once its header says so.
pub fn expected_frame_len(frame: &[u8]) -> Option<usize> {
    match frame {
        [_, function_code, ..] if function_code & 0x80 != 0 => Some(5),
        [_, READ_HOLDING_REGISTERS, byte_count, ..] => Some(5 + usize::from(*byte_count)),
        _ => None,
    }
}

/// Length of a read response carrying `quantity` registers.
pub fn response_len(quantity: u16) -> usize {
    5 + usize::from(quantity) * 2
}

/// Time `bytes` characters occupy on the wire at `baud_rate`.
pub fn transmission_time(baud_rate: u32, bytes: usize) -> Duration {
    let baud = u64::from(baud_rate.max(1));
    Duration::from_micros(bytes as u64 * BITS_PER_CHAR * 1_000_000 / baud)
}

/// Wait between writing a request and reading its response.
///
/// Covers the request and the full response on the wire plus the 3.5
/// character inter-frame gap, never less than `floor`.
pub fn settle_delay(baud_rate: u32, quantity: u16, floor: Duration) -> Duration {
    let chars = REQUEST_LEN + response_len(quantity);
    let gap = transmission_time(baud_rate, 7) / 2;
    (transmission_time(baud_rate, chars) + gap).max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    const ORACLE: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

    #[test]
    fn test_crc_of_empty_input() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_read_request_layout() {
        let frame = build_read_request(1, 3, 0, 1);
        let crc = crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(
            frame,
            [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, crc as u8, (crc >> 8) as u8]
        );
        assert_eq!(frame, [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    }

    #[test]
    fn test_read_request_address_and_quantity_big_endian() {
        let frame = build_read_request(0x11, 3, 0x006B, 0x0003);
        assert_eq!(&frame[..6], &[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]);
        assert_eq!(&frame[6..], &[0x76, 0x87]);
    }

    #[rstest]
    #[case(0, 3, 1)]
    #[case(248, 3, 1)]
    #[case(1, 4, 1)]
    #[case(1, 3, 0)]
    #[case(1, 3, 126)]
    fn test_try_build_rejects_bad_parameters(
        #[case] unit: u8,
        #[case] fc: u8,
        #[case] quantity: u16,
    ) {
        assert!(try_build_read_request(unit, fc, 0, quantity).is_err());
    }

    #[test]
    fn test_oversized_response_is_capped() {
        let registers: Vec<u16> = (0..200).collect();
        let frame = encode_read_response(1, &registers);
        assert_eq!(frame[2], 250);
        assert_eq!(frame.len(), response_len(MAX_QUANTITY));
        assert_eq!(
            decode_read_response(&frame, 1, MAX_QUANTITY),
            Ok((0..125).collect::<Vec<u16>>())
        );
    }

    #[test]
    fn test_validate_accepts_encoded_response() {
        let frame = encode_read_response(3, &[0x1234]);
        assert!(validate_response(&frame, 3));
        assert_eq!(decode_read_response(&frame, 3, 1), Ok(vec![0x1234]));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::three_bytes(vec![0x01, 0x03, 0x02])]
    fn test_validate_rejects_short_frames(#[case] frame: Vec<u8>) {
        assert!(!validate_response(&frame, 1));
        assert_eq!(
            check_response(&frame, 1),
            Err(FrameError::TooShort(frame.len()))
        );
    }

    #[test]
    fn test_validate_rejects_wrong_unit_and_function() {
        let frame = encode_read_response(2, &[7]);
        assert!(!validate_response(&frame, 1));

        let mut frame = vec![0x01, 0x04, 0x02, 0x00, 0x07];
        append_crc(&mut frame);
        assert!(matches!(
            check_response(&frame, 1),
            Err(FrameError::ProtocolMismatch { function_code: 0x04, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_corrupted_last_byte() {
        let mut frame = encode_read_response(1, &[0x00FF]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(!validate_response(&frame, 1));
        assert!(matches!(
            check_response(&frame, 1),
            Err(FrameError::CrcValidationFailure { .. })
        ));
    }

    #[test]
    fn test_crc_is_read_low_byte_first() {
        let mut frame = encode_read_response(1, &[0x0001, 0x0002]);
        let n = frame.len();
        frame.swap(n - 2, n - 1);
        assert!(!validate_response(&frame, 1));
        assert!(!has_valid_crc(&frame));
    }

    #[test]
    fn test_has_valid_crc() {
        assert!(has_valid_crc(&build_read_request(1, 3, 0, 1)));
        assert!(has_valid_crc(&encode_read_response(9, &[5])));
        assert!(!has_valid_crc(&[0xFF, 0xFF]));
        assert!(!has_valid_crc(&[]));
    }

    #[test]
    fn test_decode_rejects_byte_count_mismatch() {
        let frame = encode_read_response(1, &[1, 2]);
        assert_eq!(
            decode_read_response(&frame, 1, 3),
            Err(FrameError::ByteCountMismatch {
                expected: 6,
                actual: 4
            })
        );
    }

    #[test]
    fn test_expected_frame_len() {
        assert_eq!(expected_frame_len(&[0x01]), None);
        assert_eq!(expected_frame_len(&[0x01, 0x03]), None);
        assert_eq!(expected_frame_len(&[0x01, 0x03, 0x04]), Some(9));
        assert_eq!(expected_frame_len(&[0x01, 0x83]), Some(5));
        assert_eq!(expected_frame_len(&encode_read_response(1, &[1, 2])), Some(9));
    }

    #[test]
    fn test_settle_delay_floor_and_scaling() {
        let floor = Duration::from_millis(200);
        assert_eq!(settle_delay(9600, 1, floor), floor);
        assert_eq!(settle_delay(115_200, 10, floor), floor);
        // 125 registers at 9600 baud is ~300 ms on the wire.
        assert!(settle_delay(9600, 125, floor) > floor);
        assert!(settle_delay(9600, 125, floor) > settle_delay(19_200, 125, floor));
    }

    proptest! {
        #[test]
        fn prop_crc_matches_reference(bytes in proptest::collection::vec(any::<u8>(), 0..300)) {
            prop_assert_eq!(crc16(&bytes), ORACLE.checksum(&bytes));
        }

        #[test]
        fn prop_single_bit_flip_changes_crc(
            bytes in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut flipped = bytes.clone();
            let i = index.index(flipped.len());
            flipped[i] ^= 1 << bit;
            prop_assert_ne!(crc16(&bytes), crc16(&flipped));
        }

        #[test]
        fn prop_single_bit_flip_rejects_frame(
            registers in proptest::collection::vec(any::<u16>(), 1..20),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut frame = encode_read_response(1, &registers);
            // Keep the header intact so the CRC check is the one that trips.
            let i = 2 + index.index(frame.len() - 2);
            frame[i] ^= 1 << bit;
            prop_assert!(!validate_response(&frame, 1));
        }
    }
}
