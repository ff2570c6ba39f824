//! CHAOS loader wire protocol: opcodes, page codecs, the info record.
//!
//! Every command opens with a one-byte opcode. Page transfers use
//! big-endian addresses and sizes (the loader runs on a big-endian-bus
//! ARM); statuses and the info record's scalar fields are little-endian.

use sielink_core::error::{Error, Result};
use sielink_core::flash::{regions_from_groups, FlashRegion};
use sielink_core::helpers::xor8;

/// Liveness probe.
pub const CMD_PING: u8 = 0x41;
/// Reply to a ping.
pub const PONG: u8 = 0x52;
/// Two-stage baud change, stage 1.
pub const CMD_SET_BAUDRATE: u8 = 0x48;
/// Loader is ready for the local rate change.
pub const BAUDRATE_READY: u8 = 0x68;
/// Two-stage baud change, stage 2 (sent at the new rate).
pub const CMD_SET_BAUDRATE_ACK: u8 = 0x41;
/// Baud change committed.
pub const BAUDRATE_DONE: u8 = 0x48;
/// Request the 128-byte info record.
pub const CMD_GET_INFO: u8 = 0x49;
/// Leave the loader's command state.
pub const CMD_QUIT: u8 = 0x51;
/// Loader self-test.
pub const CMD_TEST: u8 = 0x54;
/// Page read.
pub const CMD_READ_FLASH: u8 = 0x52;
/// Flash page write (erases as needed).
pub const CMD_WRITE_FLASH: u8 = 0x46;
/// RAM page write.
pub const CMD_WRITE_RAM: u8 = 0x57;
/// CFI query passthrough.
pub const CMD_READ_CFI: u8 = 0x43;
/// Idle keep-alive byte (`.`).
pub const HEARTBEAT: u8 = 0x2E;

/// The single byte the freshly started loader announces itself with.
pub const HELLO: u8 = 0xA5;

/// Page status word: ASCII "OK" little-endian.
pub const STATUS_OK: u16 = 0x4B4F;
/// Page status word for a write whose checksum did not match.
pub const STATUS_BAD_CHECKSUM: u16 = 0xBBBB;

/// Size of the info record.
pub const INFO_LEN: usize = 128;
/// Size of the CFI reply.
pub const CFI_LEN: usize = 64;

/// Trailer after a page read's data: status + check word.
pub const READ_TRAILER_LEN: usize = 4;

/// Build a page-read request: `0x52 | addr:u32be | size:u32be`.
pub fn encode_read_request(addr: u32, size: u32) -> [u8; 9] {
    let mut request = [0u8; 9];
    request[0] = CMD_READ_FLASH;
    request[1..5].copy_from_slice(&addr.to_be_bytes());
    request[5..9].copy_from_slice(&size.to_be_bytes());
    request
}

/// Validate a page-read reply and return its data slice.
///
/// The reply is `data[size] | status:u16le | chk:u16le`; `status` must be
/// `"OK"` and `chk` the XOR of the data bytes widened to 16 bits.
pub fn check_read_reply(reply: &[u8], size: usize) -> Result<&[u8]> {
    if reply.len() != size + READ_TRAILER_LEN {
        return Err(Error::Protocol(format!(
            "page reply is {} bytes, expected {}",
            reply.len(),
            size + READ_TRAILER_LEN
        )));
    }
    let data = &reply[..size];
    let status = u16::from_le_bytes([reply[size], reply[size + 1]]);
    if status != STATUS_OK {
        return Err(Error::Protocol(format!(
            "page read failed with status {status:#06x}"
        )));
    }
    let claimed = u16::from_le_bytes([reply[size + 2], reply[size + 3]]);
    let computed = xor8(data) as u16;
    if claimed != computed {
        return Err(Error::Integrity {
            expected: claimed as u32,
            actual: computed as u32,
        });
    }
    Ok(data)
}

/// Build a page-write request:
/// `opcode | addr:u32be | size:u32be | data | chk:u8`.
pub fn encode_write_request(opcode: u8, addr: u32, data: &[u8]) -> Vec<u8> {
    let mut request = Vec::with_capacity(10 + data.len());
    request.push(opcode);
    request.extend_from_slice(&addr.to_be_bytes());
    request.extend_from_slice(&(data.len() as u32).to_be_bytes());
    request.extend_from_slice(data);
    request.push(xor8(data));
    request
}

/// Interpret a page-write status word.
pub fn check_write_status(reply: &[u8]) -> Result<()> {
    if reply.len() != 2 {
        return Err(Error::Protocol(format!(
            "write status is {} bytes, expected 2",
            reply.len()
        )));
    }
    match u16::from_le_bytes([reply[0], reply[1]]) {
        STATUS_OK => Ok(()),
        STATUS_BAD_CHECKSUM => Err(Error::Integrity {
            expected: STATUS_OK as u32,
            actual: STATUS_BAD_CHECKSUM as u32,
        }),
        other => Err(Error::Protocol(format!(
            "page write failed with status {other:#06x}"
        ))),
    }
}

/// The loader's 128-byte identification record.
#[derive(Debug, Clone)]
pub struct ChaosInfo {
    /// Phone model string.
    pub model: String,
    /// Vendor string.
    pub vendor: String,
    /// IMEI string.
    pub imei: String,
    /// First flash address.
    pub flash_base: u32,
    /// Flash vendor id.
    pub flash_vid: u16,
    /// Flash product id.
    pub flash_pid: u16,
    /// log2 of the flash size in bytes.
    pub flash_size_log2: u8,
    /// The chip's program-buffer size in bytes.
    pub write_buffer_size: u16,
    /// Erase-block map derived from the region groups.
    pub regions: Vec<FlashRegion>,
}

impl ChaosInfo {
    /// Parse the info record.
    pub fn parse(record: &[u8]) -> Result<ChaosInfo> {
        if record.len() != INFO_LEN {
            return Err(Error::Protocol(format!(
                "info record is {} bytes, expected {INFO_LEN}",
                record.len()
            )));
        }

        let cstr = |range: std::ops::Range<usize>| {
            let bytes = &record[range];
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        };

        let flash_base = u32::from_le_bytes([record[64], record[65], record[66], record[67]]);
        let region_count = record[87] as usize;
        let groups_end = 88 + region_count * 4;
        if groups_end > INFO_LEN {
            return Err(Error::Protocol(format!(
                "info record claims {region_count} region groups, which overrun the record"
            )));
        }
        let groups: Vec<(u16, u16)> = record[88..groups_end]
            .chunks_exact(4)
            .map(|g| {
                (
                    u16::from_le_bytes([g[0], g[1]]),
                    u16::from_le_bytes([g[2], g[3]]),
                )
            })
            .collect();

        Ok(ChaosInfo {
            model: cstr(0..16),
            vendor: cstr(16..32),
            imei: cstr(32..48),
            flash_base,
            flash_vid: u16::from_le_bytes([record[80], record[81]]),
            flash_pid: u16::from_le_bytes([record[82], record[83]]),
            flash_size_log2: record[84],
            write_buffer_size: u16::from_le_bytes([record[85], record[86]]),
            regions: regions_from_groups(flash_base, &groups),
        })
    }
}

#[cfg(test)]
pub(crate) fn make_info_record(
    model: &str,
    vendor: &str,
    imei: &str,
    flash_base: u32,
    groups: &[(u16, u16)],
) -> Vec<u8> {
    let mut record = vec![0u8; INFO_LEN];
    record[0..model.len()].copy_from_slice(model.as_bytes());
    record[16..16 + vendor.len()].copy_from_slice(vendor.as_bytes());
    record[32..32 + imei.len()].copy_from_slice(imei.as_bytes());
    record[64..68].copy_from_slice(&flash_base.to_le_bytes());
    record[80..82].copy_from_slice(&0x0089u16.to_le_bytes());
    record[82..84].copy_from_slice(&0x8812u16.to_le_bytes());
    record[84] = 25;
    record[85..87].copy_from_slice(&32u16.to_le_bytes());
    record[87] = groups.len() as u8;
    for (i, (count, units)) in groups.iter().enumerate() {
        let at = 88 + i * 4;
        record[at..at + 2].copy_from_slice(&count.to_le_bytes());
        record[at + 2..at + 4].copy_from_slice(&units.to_le_bytes());
    }
    record
}
