//! Encoding and decoding for the 9-byte motion-control protocol (MCP) frame
//! format used to talk to the stepper-motor controllers on the serial bus.
//!
//! MCP is modeled on Trinamic's TMCL: every request is a fixed 9-byte,
//! big-endian frame, and every well-formed request elicits exactly one
//! fixed 9-byte reply. This module is pure — no I/O, no panics on malformed
//! input. Framing, timeouts, and the single-flight bus discipline live in
//! `mcp-transport`.

use thiserror::Error;

/// Length in bytes of every MCP request and reply frame.
pub const FRAME_LEN: usize = 9;

/// Status byte meaning the command executed with no error.
pub const STATUS_OK: u8 = 100;
/// Status byte meaning the command executed and was additionally stored to
/// non-volatile memory.
pub const STATUS_STORED: u8 = 101;

/// Errors produced while decoding a reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("expected a {FRAME_LEN}-byte frame, got {0}")]
    BadLength(usize),
    #[error("checksum mismatch: frame claims {claimed:#04x}, computed {computed:#04x}")]
    BadChecksum { claimed: u8, computed: u8 },
    #[error("reply module address {got} does not match expected {expected}")]
    AddrMismatch { expected: u8, got: u8 },
    #[error("reply opcode echo {got} does not match expected {expected}")]
    OpcodeMismatch { expected: u8, got: u8 },
    #[error("device returned status {code}")]
    DeviceStatus { code: u8 },
}

/// A successfully decoded, successful reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub reply_addr: u8,
    pub module_addr: u8,
    pub status: u8,
    pub opcode_echo: u8,
    pub value: i32,
}

/// Build the 9-byte request frame for `(addr, opcode, type, bank, value)`.
///
/// Layout: `addr:u8, opcode:u8, type:u8, bank:u8, value:i32 (BE), checksum:u8`.
/// Checksum is `sum(bytes[0..8]) mod 256`.
pub fn encode_request(addr: u8, opcode: u8, r#type: u8, bank: u8, value: i32) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = addr;
    frame[1] = opcode;
    frame[2] = r#type;
    frame[3] = bank;
    frame[4..8].copy_from_slice(&value.to_be_bytes());
    frame[8] = checksum(&frame[..8]);
    frame
}

/// Decode and validate a 9-byte reply frame.
///
/// Checks, in order: length, checksum, module address match, opcode echo
/// match, and finally device status. `STATUS_OK` and `STATUS_STORED` are the
/// only statuses that produce `Ok`; every other status (known or not) is
/// surfaced as `FrameError::DeviceStatus` with the raw code preserved.
pub fn decode_reply(bytes: &[u8], expected_addr: u8, expected_opcode: u8) -> Result<Reply, FrameError> {
    if bytes.len() != FRAME_LEN {
        return Err(FrameError::BadLength(bytes.len()));
    }

    let computed = checksum(&bytes[..8]);
    let claimed = bytes[8];
    if computed != claimed {
        return Err(FrameError::BadChecksum { claimed, computed });
    }

    let reply_addr = bytes[0];
    let module_addr = bytes[1];
    let status = bytes[2];
    let opcode_echo = bytes[3];
    let value = i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

    if module_addr != expected_addr {
        return Err(FrameError::AddrMismatch {
            expected: expected_addr,
            got: module_addr,
        });
    }
    if opcode_echo != expected_opcode {
        return Err(FrameError::OpcodeMismatch {
            expected: expected_opcode,
            got: opcode_echo,
        });
    }
    if status != STATUS_OK && status != STATUS_STORED {
        return Err(FrameError::DeviceStatus { code: status });
    }

    Ok(Reply {
        reply_addr,
        module_addr,
        status,
        opcode_echo,
        value,
    })
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_ror_matches_literal_vector() {
        // spec.md §8 scenario 1.
        let frame = encode_request(12, 1, 0, 0, 100);
        assert_eq!(frame, [0x0C, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x64, 0x71]);
    }

    #[test]
    fn decode_ok_reply_matches_literal_vector() {
        // spec.md §8 scenario 2. The checksum byte there is given as 0xD3,
        // but sum(bytes[0..8]) mod 256 for this frame is 0xD7; 0xD3 is
        // indistinguishable from scenario 3's bad-checksum frame, so this
        // uses the corrected checksum to exercise the OK path.
        let bytes = [0x02, 0x0C, 0x64, 0x01, 0x00, 0x00, 0x00, 0x64, 0xD7];
        let reply = decode_reply(&bytes, 12, 1).unwrap();
        assert_eq!(reply.status, 100);
        assert_eq!(reply.value, 100);
    }

    #[test]
    fn decode_bad_checksum_matches_literal_vector() {
        // spec.md §8 scenario 3.
        let bytes = [0x02, 0x0C, 0x64, 0x01, 0x00, 0x00, 0x00, 0x64, 0x00];
        assert!(matches!(
            decode_reply(&bytes, 12, 1),
            Err(FrameError::BadChecksum { .. })
        ));
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert_eq!(decode_reply(&[0u8; 8], 0, 0), Err(FrameError::BadLength(8)));
        assert_eq!(decode_reply(&[0u8; 10], 0, 0), Err(FrameError::BadLength(10)));
    }

    #[test]
    fn decode_rejects_addr_mismatch_before_opcode() {
        let frame = encode_request(5, 1, 0, 0, 0);
        let mut reply = frame;
        // Turn the request into a plausible reply-shaped frame: reply_addr, module_addr,
        // status=OK, opcode_echo, value, checksum.
        reply[0] = 0xFF;
        reply[1] = 5;
        reply[2] = STATUS_OK;
        reply[3] = 1;
        reply[8] = checksum(&reply[..8]);
        assert_eq!(
            decode_reply(&reply, 9, 1),
            Err(FrameError::AddrMismatch { expected: 9, got: 5 })
        );
    }

    #[test]
    fn decode_rejects_opcode_mismatch() {
        let mut frame = [0u8; FRAME_LEN];
        frame[1] = 9;
        frame[2] = STATUS_OK;
        frame[3] = 2;
        frame[8] = checksum(&frame[..8]);
        assert_eq!(
            decode_reply(&frame, 9, 1),
            Err(FrameError::OpcodeMismatch { expected: 1, got: 2 })
        );
    }

    #[test]
    fn decode_maps_known_and_unknown_device_status_codes() {
        for code in [1u8, 2, 3, 4, 5, 6, 42, 200] {
            let mut frame = [0u8; FRAME_LEN];
            frame[1] = 9;
            frame[2] = code;
            frame[3] = 1;
            frame[8] = checksum(&frame[..8]);
            assert_eq!(decode_reply(&frame, 9, 1), Err(FrameError::DeviceStatus { code }));
        }
    }

    #[test]
    fn checksum_of_any_encoded_frame_is_self_consistent() {
        let frame = encode_request(200, 7, 3, 1, -12345);
        let computed: u32 = frame[..8].iter().map(|&b| b as u32).sum();
        assert_eq!((computed % 256) as u8, frame[8]);
    }

    proptest::proptest! {
        #[test]
        fn round_trip_recovers_addr_opcode_value(
            addr: u8, opcode: u8, typ: u8, bank: u8, value: i32,
        ) {
            // Build a frame shaped like a reply carrying this (addr, opcode, value)
            // at status OK, and confirm decode_reply recovers it.
            let _ = (typ, bank); // request-side fields; reply frame has no type/bank.
            let mut reply = [0u8; FRAME_LEN];
            reply[0] = 0xFF;
            reply[1] = addr;
            reply[2] = STATUS_OK;
            reply[3] = opcode;
            reply[4..8].copy_from_slice(&value.to_be_bytes());
            reply[8] = checksum(&reply[..8]);

            let decoded = decode_reply(&reply, addr, opcode).unwrap();
            proptest::prop_assert_eq!(decoded.value, value);
            proptest::prop_assert_eq!(decoded.module_addr, addr);
            proptest::prop_assert_eq!(decoded.opcode_echo, opcode);
        }

        #[test]
        fn single_bit_mutation_in_header_is_rejected(
            addr: u8, opcode: u8, value: i32, bit in 0u32..64,
        ) {
            let mut reply = [0u8; FRAME_LEN];
            reply[0] = 0xFF;
            reply[1] = addr;
            reply[2] = STATUS_OK;
            reply[3] = opcode;
            reply[4..8].copy_from_slice(&value.to_be_bytes());
            reply[8] = checksum(&reply[..8]);

            let byte = (bit / 8) as usize;
            let mask = 1u8 << (bit % 8);
            reply[byte] ^= mask;

            // A single-bit flip anywhere in bytes 0..7 changes the sum by a non-zero
            // amount smaller than 256, so the checksum can never still match.
            proptest::prop_assert!(decode_reply(&reply, addr, opcode).is_err());
        }
    }
}
