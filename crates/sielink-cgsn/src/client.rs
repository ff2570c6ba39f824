//! CGSN client: connect sequence and memory/register operations.
//!
//! CGSN is entirely AT-hosted; the client owns an [`AtChannel`] for the
//! life of the session and issues binary-kind commands through it. Bulk
//! reads and writes run through the core block engine over the 512/128
//! byte chunk windows.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use sielink_at::{AtChannel, AtCommand, AtCommandKind};
use sielink_core::blockio::{
    read_blocks, write_blocks, BlockRead, BlockWrite, ReadOutcome, Transfer, WriteOutcome,
};
use sielink_core::error::{Error, Result};
use sielink_core::transport::Transport;

use crate::commands::{
    execute_command, query_command, read_command, write_command, CpuState, ACK_BYTE, MAX_READ,
    MAX_WRITE, WRITE_ALIGN,
};

/// Address of the patch marker word.
const MARKER_ADDR: u32 = 0xA000_003C;
/// The marker identifying a patched firmware.
const MARKER: &[u8; 4] = b"CJKT";

/// Rates tried while looking for the AT endpoint.
const CONNECT_BAUDS: [u32; 3] = [115_200, 460_800, 921_600];

/// Timeout for binary transfers (a full 512-byte window at 115200 takes
/// well under a second; leave room for slow patches).
const CHUNK_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected CGSN session.
pub struct CgsnClient {
    at: Option<AtChannel>,
}

impl CgsnClient {
    /// Probe for the AT endpoint and verify the CGSN patch.
    ///
    /// Tries each candidate rate until the handshake answers, checks the
    /// `CJKT` marker at `0xA000003C` (its absence means the firmware
    /// lacks the patch), queries the connection type, and selects the
    /// transfer engine (`AT^SQWE=0` for RCCP, `=2` for GIPSY on
    /// Bluetooth links).
    pub async fn connect(mut transport: Box<dyn Transport>) -> Result<CgsnClient> {
        let mut channel = None;
        for baud in CONNECT_BAUDS {
            transport.set_baud_rate(baud).await?;
            let at = AtChannel::start(transport);
            if at.handshake(3).await.is_ok() {
                debug!(baud, "AT endpoint answered");
                channel = Some(at);
                break;
            }
            transport = at.stop().await?;
        }
        let at = channel.ok_or(Error::Timeout)?;
        let client = CgsnClient { at: Some(at) };

        let marker = read_chunk(client.at()?, MARKER_ADDR, MARKER.len()).await?;
        if marker != MARKER {
            return Err(Error::Unsupported(
                "firmware lacks the CGSN patch (marker not found)".into(),
            ));
        }

        let sifs = client
            .at()?
            .send(
                AtCommand::new("AT^SIFS")
                    .kind(AtCommandKind::PrefixFiltered)
                    .prefix("^SIFS"),
            )
            .await?;
        let bluetooth = sifs.success && sifs.first_line().contains("BLUE");

        let engine = if bluetooth { "AT^SQWE=2" } else { "AT^SQWE=0" };
        client
            .at()?
            .send(AtCommand::new(engine))
            .await?
            .ensure_success()?;
        info!(bluetooth, "CGSN session established");

        Ok(client)
    }

    /// Negotiate the best supported line rate via `AT+IPR`.
    ///
    /// Returns the rate in effect afterwards. The AT channel is restarted
    /// around the local baud change because the channel task owns the
    /// port while running.
    pub async fn negotiate_baud(&mut self) -> Result<u32> {
        let response = self
            .at()?
            .send(
                AtCommand::new("AT+IPR=?")
                    .kind(AtCommandKind::PrefixFiltered)
                    .prefix("+IPR"),
            )
            .await?
            .ensure_success()?;
        let offered = crate::commands::parse_ipr_response(response.first_line());
        let best = crate::commands::choose_baud(&offered);

        self.at()?
            .send(AtCommand::new(format!("AT+IPR={best}")))
            .await?
            .ensure_success()?;

        let channel = self.at.take().ok_or(Error::NotConnected)?;
        let mut transport = channel.stop().await?;
        transport.set_baud_rate(best).await?;
        self.at = Some(AtChannel::start(transport));
        self.at()?.handshake(3).await?;

        debug!(baud = best, "CGSN line rate negotiated");
        Ok(best)
    }

    /// Read up to 512 bytes in one command.
    pub async fn read_chunk(&self, addr: u32, len: usize) -> Result<Vec<u8>> {
        read_chunk(self.at()?, addr, len).await
    }

    /// Write up to 128 bytes in one command (4-byte aligned).
    pub async fn write_chunk(&self, addr: u32, data: &[u8]) -> Result<()> {
        write_chunk(self.at()?, addr, data).await
    }

    /// Call code at `addr` and collect the returning CPU state.
    pub async fn execute(&self, addr: u32, regs: &[u32]) -> Result<CpuState> {
        let command = AtCommand::new(execute_command(addr, regs))
            .binary(1 + CpuState::WIRE_LEN)
            .timeout(CHUNK_TIMEOUT);
        let payload = binary_exchange(self.at()?, command).await?;
        CpuState::parse(&payload)
    }

    /// Read one word at each of the given addresses.
    pub async fn query_words(&self, addrs: &[u32]) -> Result<Vec<u32>> {
        let command = AtCommand::new(query_command(addrs))
            .binary(1 + addrs.len() * 4)
            .timeout(CHUNK_TIMEOUT);
        let payload = binary_exchange(self.at()?, command).await?;
        Ok(payload
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect())
    }

    /// Bulk read through the block engine.
    pub async fn read_memory(
        &self,
        addr: u32,
        len: u32,
        transfer: &mut Transfer<'_>,
    ) -> Result<ReadOutcome> {
        let mut source = ChunkReader { at: self.at()? };
        read_blocks(&mut source, addr, len, transfer).await
    }

    /// Bulk write through the block engine.
    ///
    /// The 4-byte alignment rule is enforced up front, before any command
    /// is sent.
    pub async fn write_memory(
        &self,
        addr: u32,
        data: &[u8],
        transfer: &mut Transfer<'_>,
    ) -> Result<WriteOutcome> {
        transfer.policy.align = transfer.policy.align.max(WRITE_ALIGN);
        let mut sink = ChunkWriter { at: self.at()? };
        write_blocks(&mut sink, addr, data, transfer).await
    }

    /// Shut down the session and recover the transport.
    pub async fn disconnect(mut self) -> Result<Box<dyn Transport>> {
        let channel = self.at.take().ok_or(Error::NotConnected)?;
        channel.stop().await
    }

    fn at(&self) -> Result<&AtChannel> {
        self.at.as_ref().ok_or(Error::NotConnected)
    }
}

/// Run a binary-kind command and strip the leading ACK byte.
async fn binary_exchange(at: &AtChannel, command: AtCommand) -> Result<Vec<u8>> {
    let response = at.send(command).await?.ensure_success()?;
    let mut payload = response
        .binary
        .ok_or_else(|| Error::Protocol("binary reply missing".into()))?;
    if payload.first() != Some(&ACK_BYTE) {
        return Err(Error::Protocol(format!(
            "binary reply not acknowledged: {:02X?}",
            payload.first()
        )));
    }
    payload.remove(0);
    Ok(payload)
}

async fn read_chunk(at: &AtChannel, addr: u32, len: usize) -> Result<Vec<u8>> {
    if len == 0 || len > MAX_READ {
        return Err(Error::Protocol(format!(
            "read of {len} bytes exceeds the {MAX_READ}-byte window"
        )));
    }
    let command = AtCommand::new(read_command(addr, len as u32))
        .binary(1 + len)
        .timeout(CHUNK_TIMEOUT);
    binary_exchange(at, command).await
}

async fn write_chunk(at: &AtChannel, addr: u32, data: &[u8]) -> Result<()> {
    let text = write_command(addr, data)?;
    at.send(AtCommand::new(text).kind(AtCommandKind::NoResponse))
        .await?
        .ensure_success()?;
    Ok(())
}

/// Read-side chunk primitive for the block engine.
struct ChunkReader<'a> {
    at: &'a AtChannel,
}

#[async_trait]
impl BlockRead for ChunkReader<'_> {
    fn max_page_size(&self) -> usize {
        MAX_READ
    }

    async fn read_block(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let data = read_chunk(self.at, addr, buf.len()).await?;
        if data.len() != buf.len() {
            return Err(Error::Protocol(format!(
                "short read: {} of {} bytes",
                data.len(),
                buf.len()
            )));
        }
        buf.copy_from_slice(&data);
        Ok(())
    }
}

/// Write-side chunk primitive for the block engine.
struct ChunkWriter<'a> {
    at: &'a AtChannel,
}

#[async_trait]
impl BlockWrite for ChunkWriter<'_> {
    fn max_page_size(&self) -> usize {
        MAX_WRITE
    }

    async fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        write_chunk(self.at, addr, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sielink_core::blockio::TransferPolicy;
    use sielink_test_harness::scripted_transport;

    /// A scripted phone running the CGSN patch.
    fn patched_phone() -> impl FnMut(&[u8]) -> Vec<u8> + Send {
        move |data: &[u8]| {
            let text = String::from_utf8_lossy(data);
            let text = text.trim_end_matches('\r');

            if text == "ATQ0 V1 E0" {
                return b"OK\r\n".to_vec();
            }
            if text == "AT^SIFS" {
                return b"^SIFS: USB\r\nOK\r\n".to_vec();
            }
            if text == "AT^SQWE=0" {
                return b"OK\r\n".to_vec();
            }
            if text == "AT+IPR=?" {
                return b"+IPR: (115200,230400,460800,921600)\r\nOK\r\n".to_vec();
            }
            if text.starts_with("AT+IPR=") {
                return b"OK\r\n".to_vec();
            }
            if let Some(args) = text.strip_prefix("AT+CGSN:") {
                let (addr, len) = args.split_once(',').unwrap();
                let addr = u32::from_str_radix(addr, 16).unwrap();
                let len = u32::from_str_radix(len, 16).unwrap();
                let mut reply = vec![ACK_BYTE];
                if addr == MARKER_ADDR && len == 4 {
                    reply.extend_from_slice(MARKER);
                } else {
                    reply.extend((0..len).map(|i| (addr as u8).wrapping_add(i as u8)));
                }
                reply.extend_from_slice(b"\r\nOK\r\n");
                return reply;
            }
            if text.starts_with("AT+CGSN*") {
                return b"OK\r\n".to_vec();
            }
            if let Some(args) = text.strip_prefix("AT+CGSN@") {
                let _ = args;
                let mut reply = vec![ACK_BYTE];
                for i in 0..14u32 {
                    reply.extend_from_slice(&(0x1000 + i).to_le_bytes());
                }
                reply.extend_from_slice(b"\r\nOK\r\n");
                return reply;
            }
            if let Some(args) = text.strip_prefix("AT+CGSN%") {
                let words = args.len() / 8;
                let mut reply = vec![ACK_BYTE];
                for i in 0..words as u32 {
                    reply.extend_from_slice(&(0xCAFE_0000 + i).to_le_bytes());
                }
                reply.extend_from_slice(b"\r\nOK\r\n");
                return reply;
            }
            b"ERROR\r\n".to_vec()
        }
    }

    #[tokio::test]
    async fn connect_verifies_marker_and_engine() {
        let (transport, handle) = scripted_transport();
        handle.respond_with(patched_phone());

        let client = CgsnClient::connect(Box::new(transport)).await.unwrap();

        let sent = handle.sent();
        assert!(sent.iter().any(|w| w == b"AT+CGSN:A000003C,00000004\r"));
        assert!(sent.iter().any(|w| w == b"AT^SQWE=0\r"));
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn connect_fails_without_patch() {
        let (transport, handle) = scripted_transport();
        handle.respond_with(|data: &[u8]| {
            let text = String::from_utf8_lossy(data);
            if text.trim_end_matches('\r') == "ATQ0 V1 E0" {
                b"OK\r\n".to_vec()
            } else {
                // Stock firmware: the custom suffix is an error.
                b"ERROR\r\n".to_vec()
            }
        });

        let result = CgsnClient::connect(Box::new(transport)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn read_chunk_strips_ack() {
        let (transport, handle) = scripted_transport();
        handle.respond_with(patched_phone());

        let client = CgsnClient::connect(Box::new(transport)).await.unwrap();
        let data = client.read_chunk(0xA000_0000, 8).await.unwrap();
        assert_eq!(data.len(), 8);
        assert_eq!(data[0], 0xA0);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn write_alignment_fails_before_any_send() {
        let (transport, handle) = scripted_transport();
        handle.respond_with(patched_phone());

        let client = CgsnClient::connect(Box::new(transport)).await.unwrap();
        let writes_before = handle
            .sent()
            .iter()
            .filter(|w| w.starts_with(b"AT+CGSN*"))
            .count();

        let mut transfer = Transfer::new(TransferPolicy::default());
        let result = client
            .write_memory(0xA000_0001, &[0u8; 16], &mut transfer)
            .await;
        assert!(matches!(result, Err(Error::Alignment(_))));

        let result = client
            .write_memory(0xA000_0000, &[0u8; 10], &mut transfer)
            .await;
        assert!(matches!(result, Err(Error::Alignment(_))));

        let writes_after = handle
            .sent()
            .iter()
            .filter(|w| w.starts_with(b"AT+CGSN*"))
            .count();
        assert_eq!(writes_before, writes_after);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn bulk_read_spans_chunks() {
        let (transport, handle) = scripted_transport();
        handle.respond_with(patched_phone());

        let client = CgsnClient::connect(Box::new(transport)).await.unwrap();
        let mut transfer = Transfer::new(TransferPolicy {
            page_size: 4096,
            ..TransferPolicy::default()
        });
        // 1 KiB forces two 512-byte windows.
        let outcome = client
            .read_memory(0xA100_0000, 1024, &mut transfer)
            .await
            .unwrap();
        assert_eq!(outcome.buffer.len(), 1024);
        assert!(!outcome.canceled);

        let reads = handle
            .sent()
            .iter()
            .filter(|w| w.starts_with(b"AT+CGSN:A100"))
            .count();
        assert_eq!(reads, 2);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn bulk_write_spans_chunks() {
        let (transport, handle) = scripted_transport();
        handle.respond_with(patched_phone());

        let client = CgsnClient::connect(Box::new(transport)).await.unwrap();
        let data = vec![0x5A; 256];
        let mut transfer = Transfer::new(TransferPolicy::default());
        let outcome = client
            .write_memory(0xA200_0000, &data, &mut transfer)
            .await
            .unwrap();
        assert_eq!(outcome.written, 256);

        let writes = handle
            .sent()
            .iter()
            .filter(|w| w.starts_with(b"AT+CGSN*"))
            .count();
        assert_eq!(writes, 2);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn execute_returns_cpu_state() {
        let (transport, handle) = scripted_transport();
        handle.respond_with(patched_phone());

        let client = CgsnClient::connect(Box::new(transport)).await.unwrap();
        let state = client.execute(0xA0A0_0000, &[1, 2, 3]).await.unwrap();
        assert_eq!(state.r[0], 0x1000);
        assert_eq!(state.r[12], 0x100C);
        assert_eq!(state.cpsr, 0x100D);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn query_words_parses_each_address() {
        let (transport, handle) = scripted_transport();
        handle.respond_with(patched_phone());

        let client = CgsnClient::connect(Box::new(transport)).await.unwrap();
        let words = client
            .query_words(&[0xA000_0000, 0xA000_0004, 0xA000_0008])
            .await
            .unwrap();
        assert_eq!(words, vec![0xCAFE_0000, 0xCAFE_0001, 0xCAFE_0002]);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn baud_negotiation_restarts_channel() {
        let (transport, handle) = scripted_transport();
        handle.respond_with(patched_phone());

        let mut client = CgsnClient::connect(Box::new(transport)).await.unwrap();
        let baud = client.negotiate_baud().await.unwrap();
        assert_eq!(baud, 921_600);
        assert_eq!(handle.baud_changes().last(), Some(&921_600));
        client.disconnect().await.unwrap();
    }
}
