//! DWD frame opcodes and length rules.
//!
//! A frame body is a 16-bit little-endian opcode followed by a
//! fixed-length payload for most opcodes. The variable-length responses
//! (`0x56`, `0x77`, `0x55`) carry a `size:u16le` field at offset 2
//! followed by that many payload bytes.

use sielink_core::error::{Error, Result};

/// Connect stage 1 request (rand values and key challenge).
pub const CONNECT1_REQ: u16 = 0x58;
/// Connect stage 1 response (checks and rotate seed).
pub const CONNECT1_RESP: u16 = 0x57;
/// Connect stage 2 request (key proof).
pub const CONNECT2_REQ: u16 = 0x59;
/// Connect stage 2 response.
pub const CONNECT2_RESP: u16 = 0x56;
/// Read-memory request.
pub const READ_REQ: u16 = 0x76;
/// Read-memory response.
pub const READ_RESP: u16 = 0x77;
/// Write-memory request.
pub const WRITE_REQ: u16 = 0x78;
/// Write-memory response.
pub const WRITE_RESP: u16 = 0x79;
/// Software-version request.
pub const SW_VERSION_REQ: u16 = 0x54;
/// Software-version response.
pub const SW_VERSION_RESP: u16 = 0x55;
/// Software reset; the phone answers nothing.
pub const SW_RESET: u16 = 0xAD;

/// Fixed total length (including the opcode) for fixed-size frames;
/// `None` for variable-length ones.
pub fn fixed_len(opcode: u16) -> Option<usize> {
    match opcode {
        CONNECT1_REQ => Some(10),
        CONNECT1_RESP => Some(10),
        CONNECT2_REQ => Some(8),
        READ_REQ => Some(8),
        WRITE_RESP => Some(4),
        SW_VERSION_REQ => Some(2),
        SW_RESET => Some(2),
        _ => None,
    }
}

/// Assemble a frame body from opcode and payload.
pub fn make_frame(opcode: u16, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + payload.len());
    body.extend_from_slice(&opcode.to_le_bytes());
    body.extend_from_slice(payload);
    body
}

/// Validate a received frame body against the expected opcode and the
/// length rules, returning the payload after the opcode.
pub fn check_frame<'a>(body: &'a [u8], expect: u16) -> Result<&'a [u8]> {
    if body.len() < 2 {
        return Err(Error::Protocol("DWD frame shorter than its opcode".into()));
    }
    let opcode = u16::from_le_bytes([body[0], body[1]]);
    if opcode != expect {
        return Err(Error::Protocol(format!(
            "unexpected DWD opcode {opcode:#06x}, wanted {expect:#06x}"
        )));
    }

    if let Some(len) = fixed_len(opcode) {
        if body.len() != len {
            return Err(Error::Protocol(format!(
                "DWD frame {opcode:#06x} is {} bytes, expected {len}",
                body.len()
            )));
        }
        return Ok(&body[2..]);
    }

    // Variable frames need at least opcode + size.
    if body.len() < 4 {
        return Err(Error::Protocol(format!(
            "variable DWD frame {opcode:#06x} shorter than its header"
        )));
    }
    match opcode {
        // Revisions disagree on this frame's length; a matching opcode
        // with a complete header is enough, trailing bytes are ignored.
        CONNECT2_RESP => Ok(&body[2..]),
        _ => {
            let size = u16::from_le_bytes([body[2], body[3]]) as usize;
            if body.len() != 4 + size {
                return Err(Error::Protocol(format!(
                    "DWD frame {opcode:#06x} carries {} payload bytes, header claims {size}",
                    body.len() - 4
                )));
            }
            Ok(&body[2..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_lengths_match_the_table() {
        assert_eq!(fixed_len(CONNECT1_REQ), Some(10));
        assert_eq!(fixed_len(CONNECT1_RESP), Some(10));
        assert_eq!(fixed_len(CONNECT2_REQ), Some(8));
        assert_eq!(fixed_len(READ_REQ), Some(8));
        assert_eq!(fixed_len(WRITE_RESP), Some(4));
        assert_eq!(fixed_len(SW_VERSION_REQ), Some(2));
        assert_eq!(fixed_len(SW_RESET), Some(2));
        assert_eq!(fixed_len(READ_RESP), None);
        assert_eq!(fixed_len(CONNECT2_RESP), None);
        assert_eq!(fixed_len(SW_VERSION_RESP), None);
    }

    #[test]
    fn make_frame_prepends_opcode() {
        let body = make_frame(READ_REQ, &[0x1E, 0x00, 0x00, 0x00, 0x00, 0xA0]);
        assert_eq!(body, vec![0x76, 0x00, 0x1E, 0x00, 0x00, 0x00, 0x00, 0xA0]);
    }

    #[test]
    fn check_frame_fixed_length() {
        let body = make_frame(WRITE_RESP, &[0x00, 0x00]);
        assert_eq!(check_frame(&body, WRITE_RESP).unwrap(), &[0x00, 0x00]);

        let short = make_frame(WRITE_RESP, &[0x00]);
        assert!(check_frame(&short, WRITE_RESP).is_err());
    }

    #[test]
    fn check_frame_wrong_opcode() {
        let body = make_frame(WRITE_RESP, &[0x00, 0x00]);
        assert!(check_frame(&body, READ_RESP).is_err());
    }

    #[test]
    fn check_frame_variable_with_size() {
        let body = make_frame(READ_RESP, &[0x02, 0x00, 0xAA, 0xBB]);
        let payload = check_frame(&body, READ_RESP).unwrap();
        assert_eq!(payload, &[0x02, 0x00, 0xAA, 0xBB]);

        // Size field disagreeing with the body is rejected.
        let bad = make_frame(READ_RESP, &[0x05, 0x00, 0xAA]);
        assert!(check_frame(&bad, READ_RESP).is_err());
    }

    #[test]
    fn connect2_response_tolerates_trailing_bytes() {
        // Header only.
        let short = make_frame(CONNECT2_RESP, &[0x00, 0x00]);
        assert!(check_frame(&short, CONNECT2_RESP).is_ok());
        // Longer revision of the same frame.
        let long = make_frame(CONNECT2_RESP, &[0x02, 0x00, 0x12, 0x34, 0x56]);
        assert!(check_frame(&long, CONNECT2_RESP).is_ok());
    }
}
