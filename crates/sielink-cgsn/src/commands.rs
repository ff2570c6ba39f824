//! CGSN command text builders and response parsing helpers.
//!
//! The CGSN firmware patch exposes memory access through suffixes of the
//! stock `AT+CGSN` command. Addresses and lengths are uppercase,
//! zero-padded 8-digit hex:
//!
//! ```text
//! AT+CGSN:AAAAAAAA,LLLLLLLL   read L bytes at A (binary reply)
//! AT+CGSN*AAAAAAAA<hex>       write hex-encoded bytes at A
//! AT+CGSN@AAAAAAAA,r0,r1,…    call A with initial registers
//! AT+CGSN%A1A2…An             read one word at each address
//! ```

use sielink_core::error::{Error, Result};
use sielink_core::helpers::hex32;

/// Largest single read window.
pub const MAX_READ: usize = 512;
/// Largest single write (data bytes, before hex encoding).
pub const MAX_WRITE: usize = 128;
/// Writes must align addresses and lengths to this.
pub const WRITE_ALIGN: u32 = 4;

/// First byte of every binary reply.
pub const ACK_BYTE: u8 = 0xA1;

/// Build a read command.
pub fn read_command(addr: u32, len: u32) -> String {
    format!("AT+CGSN:{},{}", hex32(addr), hex32(len))
}

/// Build a write command.
///
/// Enforces the write rules before anything touches the wire: at most
/// [`MAX_WRITE`] bytes, address and length multiples of four.
pub fn write_command(addr: u32, data: &[u8]) -> Result<String> {
    if data.len() > MAX_WRITE {
        return Err(Error::Protocol(format!(
            "write of {} bytes exceeds the {MAX_WRITE}-byte window",
            data.len()
        )));
    }
    if addr % WRITE_ALIGN != 0 {
        return Err(Error::Alignment(format!(
            "write address {addr:#010x} is not a multiple of {WRITE_ALIGN}"
        )));
    }
    if data.len() % WRITE_ALIGN as usize != 0 {
        return Err(Error::Alignment(format!(
            "write length {} is not a multiple of {WRITE_ALIGN}",
            data.len()
        )));
    }

    let mut command = format!("AT+CGSN*{}", hex32(addr));
    for byte in data {
        command.push_str(&format!("{byte:02X}"));
    }
    Ok(command)
}

/// Build an execute command calling `addr` with the given initial
/// registers.
pub fn execute_command(addr: u32, regs: &[u32]) -> String {
    let mut command = format!("AT+CGSN@{}", hex32(addr));
    for reg in regs {
        command.push(',');
        command.push_str(&hex32(*reg));
    }
    command
}

/// Build a bulk word-query command.
pub fn query_command(addrs: &[u32]) -> String {
    let mut command = String::from("AT+CGSN%");
    for addr in addrs {
        command.push_str(&hex32(*addr));
    }
    command
}

/// CPU state returned by an execute command: r0-r12 plus CPSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuState {
    /// General registers r0 through r12.
    pub r: [u32; 13],
    /// The saved program status register.
    pub cpsr: u32,
}

impl CpuState {
    /// Number of payload bytes after the ACK byte.
    pub const WIRE_LEN: usize = 14 * 4;

    /// Parse the 14 little-endian words of an execute reply.
    pub fn parse(payload: &[u8]) -> Result<CpuState> {
        if payload.len() != Self::WIRE_LEN {
            return Err(Error::Protocol(format!(
                "execute reply carries {} bytes, expected {}",
                payload.len(),
                Self::WIRE_LEN
            )));
        }
        let word = |i: usize| {
            u32::from_le_bytes([
                payload[i * 4],
                payload[i * 4 + 1],
                payload[i * 4 + 2],
                payload[i * 4 + 3],
            ])
        };
        let mut r = [0u32; 13];
        for (i, slot) in r.iter_mut().enumerate() {
            *slot = word(i);
        }
        Ok(CpuState { r, cpsr: word(13) })
    }
}

/// Extract the rates offered by an `AT+IPR=?` reply.
///
/// The reply lists one or more parenthesised groups,
/// `+IPR: (0,115200,…),(115200,…)`; every number in every group counts
/// as offered.
pub fn parse_ipr_response(line: &str) -> Vec<u32> {
    let mut rates = Vec::new();
    let mut inside = false;
    let mut current = String::new();
    for c in line.chars() {
        match c {
            '(' => inside = true,
            ')' | ',' if inside => {
                if let Ok(rate) = current.parse::<u32>() {
                    if rate > 0 {
                        rates.push(rate);
                    }
                }
                current.clear();
                if c == ')' {
                    inside = false;
                }
            }
            d if inside && d.is_ascii_digit() => current.push(d),
            _ => {}
        }
    }
    rates
}

/// Pick the connection rate from the offered list.
///
/// The highest offer wins, but when nothing at 921600 or above is on the
/// table the choice is capped at 115200 (older firmware advertises rates
/// it cannot sustain).
pub fn choose_baud(offered: &[u32]) -> u32 {
    let best = offered.iter().copied().max().unwrap_or(115_200);
    if best >= 921_600 {
        best
    } else {
        best.min(115_200)
    }
}
