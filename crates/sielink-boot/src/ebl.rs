//! EBL second-stage bootloader protocol.
//!
//! Once BSL has uploaded and started EBL, the firmware accepts checksummed
//! request/response packets:
//!
//! ```text
//! +-------+---------+----------+-----------+---------+-------+
//! | Start |   Cmd   |   Size   |  Payload  |  Chksum |  End  |
//! +-------+---------+----------+-----------+---------+-------+
//! | 02 00 | u16 le  |  u16 le  | size bytes|  u16 le | 03 00 |
//! +-------+---------+----------+-----------+---------+-------+
//! ```
//!
//! The checksum is `(cmd + size + Σ payload bytes) mod 2^16`. A response
//! echoes the request's command word.

use std::time::Duration;
use tracing::{debug, trace};

use sielink_core::error::{Error, Result};
use sielink_core::transport::{read_exact, Transport};

/// Start-of-packet token.
pub const START_TOKEN: u16 = 0x0002;
/// End-of-packet token.
pub const END_TOKEN: u16 = 0x0003;

/// Switch the line to a new baud rate; the payload is echoed back.
pub const CMD_SET_BAUDRATE: u16 = 0x0082;
/// Program the external bus controller (88-byte record).
pub const CMD_SET_EBU_CONFIG: u16 = 0x0083;
/// First stage of the CFI flash probe.
pub const CMD_CFI_STAGE1: u16 = 0x0084;
/// Second stage of the CFI flash probe; returns the descriptors.
pub const CMD_CFI_STAGE2: u16 = 0x0085;

/// Per-exchange response timeout.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Size of one CFI flash descriptor.
const CFI_DESCRIPTOR_LEN: usize = 64;

/// Packet checksum: `(cmd + size + Σ payload) mod 2^16`.
pub fn checksum(cmd: u16, payload: &[u8]) -> u16 {
    let sum = cmd as u32
        + payload.len() as u32
        + payload.iter().map(|&b| b as u32).sum::<u32>();
    sum as u16
}

/// Encode one packet for the wire.
pub fn encode_packet(cmd: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + 10);
    packet.extend_from_slice(&START_TOKEN.to_le_bytes());
    packet.extend_from_slice(&cmd.to_le_bytes());
    packet.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    packet.extend_from_slice(payload);
    packet.extend_from_slice(&checksum(cmd, payload).to_le_bytes());
    packet.extend_from_slice(&END_TOKEN.to_le_bytes());
    packet
}

/// One chip select's external-bus settings within the EBU record.
#[derive(Debug, Clone, Copy, Default)]
pub struct EbuBank {
    /// Chip-select index.
    pub cs: u32,
    /// Address-select register value.
    pub addrsel: u32,
    /// Bus-configuration register value.
    pub buscon: u32,
    /// Bus access-parameter register value.
    pub busap: u32,
}

/// The 88-byte external-bus configuration record.
#[derive(Debug, Clone, Default)]
pub struct EbuConfig {
    /// The four chip-select banks.
    pub banks: [EbuBank; 4],
}

impl EbuConfig {
    /// Fixed record prologue.
    const PROLOGUE: [u32; 6] = [5, 0x0402_0000, 115_200, 2, 1, 0];

    /// Serialize the record.
    pub fn encode(&self) -> Vec<u8> {
        let mut record = Vec::with_capacity(88);
        for word in Self::PROLOGUE {
            record.extend_from_slice(&word.to_le_bytes());
        }
        for bank in &self.banks {
            record.extend_from_slice(&bank.cs.to_le_bytes());
            record.extend_from_slice(&bank.addrsel.to_le_bytes());
            record.extend_from_slice(&bank.buscon.to_le_bytes());
            record.extend_from_slice(&bank.busap.to_le_bytes());
        }
        record
    }
}

/// One flash chip descriptor from the CFI probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashCfi {
    /// JEDEC vendor id.
    pub vendor_id: u16,
    /// JEDEC device id.
    pub device_id: u16,
    /// Device size in bytes (`1 << size_log2`).
    pub size: u32,
    /// `false` when the chip select answered all zeros (no device).
    pub present: bool,
}

impl FlashCfi {
    fn parse(raw: &[u8]) -> FlashCfi {
        let present = raw.iter().any(|&b| b != 0);
        FlashCfi {
            vendor_id: u16::from_le_bytes([raw[0], raw[1]]),
            device_id: u16::from_le_bytes([raw[2], raw[3]]),
            size: if present { 1u32 << raw[4].min(31) } else { 0 },
            present,
        }
    }
}

/// Client for an EBL endpoint. Exclusively borrows the transport for each
/// exchange.
pub struct EblClient<'a> {
    transport: &'a mut dyn Transport,
}

impl<'a> EblClient<'a> {
    /// Wrap a transport on which EBL is already running.
    pub fn new(transport: &'a mut dyn Transport) -> Self {
        EblClient { transport }
    }

    /// One write-then-read packet exchange. Returns the response payload.
    pub async fn transact(&mut self, cmd: u16, payload: &[u8]) -> Result<Vec<u8>> {
        let packet = encode_packet(cmd, payload);
        trace!(cmd = format_args!("{cmd:#06x}"), bytes = payload.len(), "EBL request");
        self.transport.send(&packet).await?;

        let mut header = [0u8; 6];
        if read_exact(self.transport, &mut header, RESPONSE_TIMEOUT).await? != 6 {
            return Err(Error::Timeout);
        }
        let start = u16::from_le_bytes([header[0], header[1]]);
        let reply_cmd = u16::from_le_bytes([header[2], header[3]]);
        let size = u16::from_le_bytes([header[4], header[5]]) as usize;

        if start != START_TOKEN {
            return Err(Error::Protocol(format!(
                "bad EBL start token {start:#06x}"
            )));
        }
        if reply_cmd != cmd {
            return Err(Error::Protocol(format!(
                "EBL response command {reply_cmd:#06x} does not match request {cmd:#06x}"
            )));
        }

        let mut body = vec![0u8; size + 4];
        if read_exact(self.transport, &mut body, RESPONSE_TIMEOUT).await? != body.len() {
            return Err(Error::Timeout);
        }

        let end = u16::from_le_bytes([body[size + 2], body[size + 3]]);
        if end != END_TOKEN {
            return Err(Error::Protocol(format!("bad EBL end token {end:#06x}")));
        }

        let claimed = u16::from_le_bytes([body[size], body[size + 1]]);
        let computed = checksum(reply_cmd, &body[..size]);
        if claimed != computed {
            return Err(Error::Integrity {
                expected: claimed as u32,
                actual: computed as u32,
            });
        }

        body.truncate(size);
        Ok(body)
    }

    /// Negotiate a new line speed.
    ///
    /// EBL echoes the requested rate back; the local port is switched only
    /// on an exact echo match.
    pub async fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        let reply = self.transact(CMD_SET_BAUDRATE, &baud.to_le_bytes()).await?;
        if reply != baud.to_le_bytes() {
            return Err(Error::Protocol(format!(
                "EBL did not accept baud rate {baud}"
            )));
        }
        self.transport.set_baud_rate(baud).await?;
        debug!(baud, "EBL line speed changed");
        Ok(())
    }

    /// Program the external bus controller.
    pub async fn set_ebu_config(&mut self, config: &EbuConfig) -> Result<()> {
        let record = config.encode();
        self.transact(CMD_SET_EBU_CONFIG, &record).await?;
        Ok(())
    }

    /// Two-stage CFI probe of the flash chip selects.
    pub async fn read_cfi(&mut self) -> Result<[FlashCfi; 4]> {
        self.transact(CMD_CFI_STAGE1, &[]).await?;
        let raw = self.transact(CMD_CFI_STAGE2, &[]).await?;
        if raw.len() != 4 * CFI_DESCRIPTOR_LEN {
            return Err(Error::Protocol(format!(
                "CFI probe returned {} bytes, expected {}",
                raw.len(),
                4 * CFI_DESCRIPTOR_LEN
            )));
        }
        let descriptors: Vec<FlashCfi> = raw
            .chunks_exact(CFI_DESCRIPTOR_LEN)
            .map(FlashCfi::parse)
            .collect();
        descriptors
            .try_into()
            .map_err(|_| Error::Protocol("CFI probe did not yield four descriptors".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sielink_test_harness::MockTransport;

    #[test]
    fn checksum_sums_cmd_size_payload() {
        assert_eq!(checksum(0x0082, &[]), 0x0082);
        assert_eq!(checksum(0x0001, &[0x02, 0x03]), 0x0001 + 2 + 0x02 + 0x03);
        // Wraps mod 2^16.
        assert_eq!(checksum(0xFFFF, &[0xFF]), 0xFFFFu32.wrapping_add(1 + 0xFF) as u16);
    }

    #[test]
    fn packet_layout() {
        let packet = encode_packet(0x0082, &[0xAA, 0xBB]);
        assert_eq!(&packet[0..2], &[0x02, 0x00]);
        assert_eq!(&packet[2..4], &[0x82, 0x00]);
        assert_eq!(&packet[4..6], &[0x02, 0x00]);
        assert_eq!(&packet[6..8], &[0xAA, 0xBB]);
        let chk = checksum(0x0082, &[0xAA, 0xBB]);
        assert_eq!(&packet[8..10], &chk.to_le_bytes());
        assert_eq!(&packet[10..12], &[0x03, 0x00]);
    }

    #[test]
    fn ebu_record_is_88_bytes_with_prologue() {
        let config = EbuConfig {
            banks: [
                EbuBank { cs: 0, addrsel: 0xA0000001, buscon: 0x30000000, busap: 0x1 },
                EbuBank::default(),
                EbuBank::default(),
                EbuBank::default(),
            ],
        };
        let record = config.encode();
        assert_eq!(record.len(), 88);
        assert_eq!(&record[0..4], &5u32.to_le_bytes());
        assert_eq!(&record[4..8], &0x0402_0000u32.to_le_bytes());
        assert_eq!(&record[8..12], &115_200u32.to_le_bytes());
        assert_eq!(&record[12..16], &2u32.to_le_bytes());
        assert_eq!(&record[16..20], &1u32.to_le_bytes());
        assert_eq!(&record[20..24], &0u32.to_le_bytes());
        assert_eq!(&record[24..28], &0u32.to_le_bytes());
        assert_eq!(&record[28..32], &0xA0000001u32.to_le_bytes());
    }

    #[tokio::test]
    async fn transact_round_trip() {
        let mut mock = MockTransport::new();
        let request = encode_packet(0x0084, &[]);
        let response = encode_packet(0x0084, &[0x11, 0x22]);
        mock.expect(&request, &response);

        let mut client = EblClient::new(&mut mock);
        let payload = client.transact(0x0084, &[]).await.unwrap();
        assert_eq!(payload, vec![0x11, 0x22]);
    }

    #[tokio::test]
    async fn transact_rejects_command_mismatch() {
        let mut mock = MockTransport::new();
        let request = encode_packet(0x0084, &[]);
        let response = encode_packet(0x0085, &[]);
        mock.expect(&request, &response);

        let mut client = EblClient::new(&mut mock);
        let result = client.transact(0x0084, &[]).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn transact_rejects_bad_checksum() {
        let mut mock = MockTransport::new();
        let request = encode_packet(0x0084, &[]);
        let mut response = encode_packet(0x0084, &[0x11]);
        // Corrupt the checksum.
        let len = response.len();
        response[len - 4] ^= 0xFF;
        mock.expect(&request, &response);

        let mut client = EblClient::new(&mut mock);
        let result = client.transact(0x0084, &[]).await;
        assert!(matches!(result, Err(Error::Integrity { .. })));
    }

    #[tokio::test]
    async fn transact_rejects_bad_end_token() {
        let mut mock = MockTransport::new();
        let request = encode_packet(0x0084, &[]);
        let mut response = encode_packet(0x0084, &[]);
        let len = response.len();
        response[len - 2] = 0x09;
        mock.expect(&request, &response);

        let mut client = EblClient::new(&mut mock);
        let result = client.transact(0x0084, &[]).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn set_baud_rate_adopts_on_echo() {
        let mut mock = MockTransport::new();
        let request = encode_packet(CMD_SET_BAUDRATE, &921_600u32.to_le_bytes());
        let response = encode_packet(CMD_SET_BAUDRATE, &921_600u32.to_le_bytes());
        mock.expect(&request, &response);

        {
            let mut client = EblClient::new(&mut mock);
            client.set_baud_rate(921_600).await.unwrap();
        }
        assert_eq!(mock.baud_changes(), &[921_600]);
    }

    #[tokio::test]
    async fn set_baud_rate_keeps_local_rate_on_mismatch() {
        let mut mock = MockTransport::new();
        let request = encode_packet(CMD_SET_BAUDRATE, &921_600u32.to_le_bytes());
        let response = encode_packet(CMD_SET_BAUDRATE, &115_200u32.to_le_bytes());
        mock.expect(&request, &response);

        {
            let mut client = EblClient::new(&mut mock);
            let result = client.set_baud_rate(921_600).await;
            assert!(matches!(result, Err(Error::Protocol(_))));
        }
        assert!(mock.baud_changes().is_empty());
    }

    #[tokio::test]
    async fn read_cfi_parses_descriptors() {
        let mut raw = vec![0u8; 256];
        // First descriptor: vendor 0x0089, device 0x8812, 2^24 bytes.
        raw[0] = 0x89;
        raw[1] = 0x00;
        raw[2] = 0x12;
        raw[3] = 0x88;
        raw[4] = 24;

        let mut mock = MockTransport::new();
        mock.expect(&encode_packet(CMD_CFI_STAGE1, &[]), &encode_packet(CMD_CFI_STAGE1, &[]));
        mock.expect(&encode_packet(CMD_CFI_STAGE2, &[]), &encode_packet(CMD_CFI_STAGE2, &raw));

        let mut client = EblClient::new(&mut mock);
        let descriptors = client.read_cfi().await.unwrap();
        assert!(descriptors[0].present);
        assert_eq!(descriptors[0].vendor_id, 0x0089);
        assert_eq!(descriptors[0].device_id, 0x8812);
        assert_eq!(descriptors[0].size, 1 << 24);
        assert!(!descriptors[1].present);
        assert_eq!(descriptors[1].size, 0);
    }
}
