//! The DWD AT envelope.
//!
//! DWD frames travel inside a quoted AT line so the phone's command
//! dispatcher can route them without a mode switch. The envelope is:
//!
//! ```text
//! "AT#" | n_escapes | offset_1 … offset_n | body | 0x0D
//! ```
//!
//! Any `0x0D` inside the raw frame body would terminate the line early,
//! so each one is rewritten to `0x0C` and its position recorded in the
//! escape map. Offsets are 14-based: an escaped byte at body index `i` is
//! recorded as `14 + i`. After encapsulation the only `0x0D` on the wire
//! is the trailer, which is what lets the receiver delimit a frame by
//! scanning for CR.

use sielink_core::error::{Error, Result};

/// Envelope prefix.
pub const PREFIX: &[u8; 3] = b"AT#";
/// Line terminator; never appears inside an escaped body.
pub const CR: u8 = 0x0D;
/// Replacement byte for escaped CRs.
pub const ESCAPED_CR: u8 = 0x0C;

/// Bias added to body indices in the escape map.
const OFFSET_BIAS: u8 = 14;

/// Wrap a raw frame body in the AT envelope.
pub fn encapsulate(body: &[u8]) -> Vec<u8> {
    let escapes: Vec<usize> = body
        .iter()
        .enumerate()
        .filter(|&(_, &b)| b == CR)
        .map(|(i, _)| i)
        .collect();

    let mut wire = Vec::with_capacity(PREFIX.len() + 1 + escapes.len() + body.len() + 1);
    wire.extend_from_slice(PREFIX);
    wire.push(escapes.len() as u8);
    for &index in &escapes {
        wire.push(OFFSET_BIAS.wrapping_add(index as u8));
    }
    for &b in body {
        wire.push(if b == CR { ESCAPED_CR } else { b });
    }
    wire.push(CR);
    wire
}

/// Unwrap an AT envelope back into the raw frame body.
///
/// `wire` must be one complete envelope, prefix through trailing CR.
pub fn decapsulate(wire: &[u8]) -> Result<Vec<u8>> {
    if wire.len() < PREFIX.len() + 2 || !wire.starts_with(PREFIX) {
        return Err(Error::Protocol("DWD envelope prefix missing".into()));
    }
    if wire.last() != Some(&CR) {
        return Err(Error::Protocol("DWD envelope not CR-terminated".into()));
    }

    let n_escapes = wire[3] as usize;
    let body_start = 4 + n_escapes;
    if wire.len() < body_start + 1 {
        return Err(Error::Protocol("DWD envelope shorter than its escape map".into()));
    }

    let mut body = wire[body_start..wire.len() - 1].to_vec();
    for &offset in &wire[4..4 + n_escapes] {
        let index = offset.wrapping_sub(OFFSET_BIAS) as usize;
        match body.get(index) {
            Some(&ESCAPED_CR) => body[index] = CR,
            Some(&other) => {
                return Err(Error::Protocol(format!(
                    "escape map points at {other:#04x}, not an escaped CR"
                )))
            }
            None => {
                return Err(Error::Protocol(format!(
                    "escape offset {offset} is outside the body"
                )))
            }
        }
    }
    Ok(body)
}
