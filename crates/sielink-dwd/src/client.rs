//! DWD client: V24 toggle, keyed handshake, and memory I/O.
//!
//! DWD speaks raw envelopes on the serial line, so the client exclusively
//! owns its transport; there is no separate channel engine. Every
//! operation is one write-then-read cycle: send an encapsulated frame,
//! collect bytes until the CR trailer, decapsulate, check the opcode.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use sielink_core::blockio::{
    read_blocks, write_blocks, BlockRead, BlockWrite, ReadOutcome, Transfer, WriteOutcome,
};
use sielink_core::error::{Error, Result};
use sielink_core::transport::{drain, read_byte, Transport};

use crate::envelope::{decapsulate, encapsulate, CR};
use crate::frame::{
    check_frame, make_frame, CONNECT1_REQ, CONNECT1_RESP, CONNECT2_REQ, CONNECT2_RESP, READ_REQ,
    READ_RESP, SW_RESET, SW_VERSION_REQ, SW_VERSION_RESP, WRITE_REQ, WRITE_RESP,
};
use crate::keys::{
    builtin_keysets, connect1_challenge, connect2_proof, expected_chk1, expected_chk2, key_rotate,
    Keyset, AUTO, RAND1, RAND2, RAND3, RAND4,
};

/// V24 debug-tap enable command, written literally (not enveloped).
const V24_ENABLE: [u8; 9] = [0x41, 0x54, 0x23, 0xFD, 0x0D, 0x00, 0x66, 0x8D, 0xED];
/// V24 debug-tap disable command.
const V24_DISABLE: [u8; 9] = [0x41, 0x54, 0x23, 0xFE, 0x0D, 0x00, 0x66, 0x8D, 0xED];

/// Bytes drained after a V24 toggle.
const V24_DRAIN_MAX: usize = 32;
/// Quiet window for the post-toggle drain.
const V24_DRAIN_WINDOW: Duration = Duration::from_millis(20);

/// Per-exchange response timeout.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest read window one request may carry.
pub const MAX_READ_CHUNK: usize = 230;
/// Largest write window one request may carry.
pub const MAX_WRITE_CHUNK: usize = 226;

/// Parsed fields of a stage-1 handshake response.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Connect1Response {
    pub echo: u16,
    pub chk1: u16,
    pub r6: u16,
    pub chk2: u16,
}

/// A DWD endpoint.
pub struct DwdClient {
    transport: Box<dyn Transport>,
    keyset: Keyset,
    connected: bool,
}

impl DwdClient {
    /// Wrap a transport carrying a DWD-capable firmware.
    pub fn new(transport: Box<dyn Transport>) -> DwdClient {
        DwdClient {
            transport,
            keyset: Keyset::ZERO,
            connected: false,
        }
    }

    /// `true` after a successful handshake.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Enable the V24 debug tap, then handshake with the named keyset.
    ///
    /// Selecting `"auto"` walks the built-in keyset table in its declared
    /// order until one handshake succeeds. Returns the name of the
    /// keyset that worked.
    pub async fn connect(&mut self, keyset_name: &str) -> Result<&'static str> {
        self.v24(true).await?;

        if keyset_name == AUTO {
            let mut last = Error::AuthDenied;
            for (name, keyset) in builtin_keysets() {
                trace!(keyset = *name, "attempting handshake");
                match self.handshake(keyset).await {
                    Ok(()) => {
                        info!(keyset = *name, "DWD handshake succeeded");
                        self.connected = true;
                        return Ok(*name);
                    }
                    Err(e) => last = e,
                }
            }
            return Err(last);
        }

        let (name, keyset) = builtin_keysets()
            .iter()
            .find(|(n, _)| *n == keyset_name)
            .ok_or_else(|| Error::Unsupported(format!("unknown keyset {keyset_name:?}")))?;
        self.handshake(keyset).await?;
        self.connected = true;
        info!(keyset = *name, "DWD handshake succeeded");
        Ok(*name)
    }

    /// The keyset in use after a successful [`DwdClient::connect`].
    pub fn keyset(&self) -> &Keyset {
        &self.keyset
    }

    /// The two-stage keyed handshake.
    async fn handshake(&mut self, keyset: &Keyset) -> Result<()> {
        let response = self.connect1_exchange(keyset).await?;

        if response.echo != RAND1 {
            return Err(Error::Protocol(format!(
                "handshake echoed {:#06x}, sent {RAND1:#06x}",
                response.echo
            )));
        }
        if response.chk1 != expected_chk1() {
            return Err(Error::Protocol(format!(
                "handshake chk1 mismatch: {:#06x}",
                response.chk1
            )));
        }
        let rotate = key_rotate(response.r6);
        if response.chk2 != expected_chk2(keyset, rotate) {
            return Err(Error::AuthDenied);
        }

        let mut payload = Vec::with_capacity(6);
        payload.extend_from_slice(&RAND4.to_le_bytes());
        payload.extend_from_slice(&connect2_proof(keyset, rotate).to_le_bytes());
        payload.extend_from_slice(&RAND4.to_le_bytes());
        // Any response with the right opcode closes the handshake;
        // firmware revisions disagree on its length.
        self.transact(CONNECT2_REQ, &payload, CONNECT2_RESP).await?;

        self.keyset = *keyset;
        Ok(())
    }

    /// One stage-1 exchange; shared with the bruteforce routines.
    pub(crate) async fn connect1_exchange(&mut self, keyset: &Keyset) -> Result<Connect1Response> {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&RAND1.to_le_bytes());
        payload.extend_from_slice(&connect1_challenge(keyset).to_le_bytes());
        payload.extend_from_slice(&RAND2.to_le_bytes());
        payload.extend_from_slice(&RAND3.to_le_bytes());

        let fields = self.transact(CONNECT1_REQ, &payload, CONNECT1_RESP).await?;
        let word = |i: usize| u16::from_le_bytes([fields[i], fields[i + 1]]);
        Ok(Connect1Response {
            echo: word(0),
            chk1: word(2),
            r6: word(4),
            chk2: word(6),
        })
    }

    /// Toggle the V24 debug tap and flush whatever the firmware spits
    /// out in response.
    pub async fn v24(&mut self, enable: bool) -> Result<()> {
        let command = if enable { &V24_ENABLE } else { &V24_DISABLE };
        debug!(enable, "toggling V24 debug tap");
        self.transport.send(command).await?;
        drain(self.transport.as_mut(), V24_DRAIN_MAX, V24_DRAIN_WINDOW).await?;
        Ok(())
    }

    /// One enveloped request/response exchange.
    async fn transact(&mut self, opcode: u16, payload: &[u8], expect: u16) -> Result<Vec<u8>> {
        let body = make_frame(opcode, payload);
        self.transport.send(&encapsulate(&body)).await?;
        let wire = self.read_envelope(RESPONSE_TIMEOUT).await?;
        let body = decapsulate(&wire)?;
        Ok(check_frame(&body, expect)?.to_vec())
    }

    /// Collect one complete envelope off the wire.
    ///
    /// Escaping guarantees CR appears only as the trailer -- except the
    /// escape-count byte at index 3, which may legitimately be 13.
    async fn read_envelope(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut wire = Vec::with_capacity(64);
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            match read_byte(self.transport.as_mut(), deadline - now).await? {
                Some(byte) => {
                    wire.push(byte);
                    if byte == CR && wire.len() != 4 {
                        return Ok(wire);
                    }
                }
                None => return Err(Error::Timeout),
            }
        }
    }

    /// Read one chunk (at most [`MAX_READ_CHUNK`] bytes).
    pub(crate) async fn read_chunk(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(6);
        payload.extend_from_slice(&(buf.len() as u16).to_le_bytes());
        payload.extend_from_slice(&addr.to_le_bytes());

        let fields = self.transact(READ_REQ, &payload, READ_RESP).await?;
        let size = u16::from_le_bytes([fields[0], fields[1]]) as usize;
        if size != buf.len() {
            return Err(Error::Protocol(format!(
                "read returned {size} bytes, requested {}",
                buf.len()
            )));
        }
        buf.copy_from_slice(&fields[2..]);
        Ok(())
    }

    /// Write one chunk (at most [`MAX_WRITE_CHUNK`] bytes).
    pub(crate) async fn write_chunk(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(6 + data.len());
        payload.extend_from_slice(&(data.len() as u16).to_le_bytes());
        payload.extend_from_slice(&addr.to_le_bytes());
        payload.extend_from_slice(data);

        let fields = self.transact(WRITE_REQ, &payload, WRITE_RESP).await?;
        let status = u16::from_le_bytes([fields[0], fields[1]]);
        if status != 0 {
            return Err(Error::Protocol(format!(
                "write rejected with status {status:#06x}"
            )));
        }
        Ok(())
    }

    /// Read one 32-bit little-endian word.
    pub async fn read_word(&mut self, addr: u32) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_chunk(addr, &mut buf).await?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Bulk read through the block engine (byte-granular, 230-byte
    /// windows, three retries by default).
    pub async fn read_memory(
        &mut self,
        addr: u32,
        len: u32,
        transfer: &mut Transfer<'_>,
    ) -> Result<ReadOutcome> {
        let mut source = ChunkSource { client: self };
        read_blocks(&mut source, addr, len, transfer).await
    }

    /// Bulk write through the block engine (226-byte windows).
    pub async fn write_memory(
        &mut self,
        addr: u32,
        data: &[u8],
        transfer: &mut Transfer<'_>,
    ) -> Result<WriteOutcome> {
        let mut sink = ChunkSink { client: self };
        write_blocks(&mut sink, addr, data, transfer).await
    }

    /// Query the firmware version string.
    pub async fn sw_version(&mut self) -> Result<String> {
        let fields = self
            .transact(SW_VERSION_REQ, &[], SW_VERSION_RESP)
            .await?;
        let text = &fields[2..];
        Ok(String::from_utf8_lossy(text)
            .trim_end_matches('\0')
            .to_string())
    }

    /// Reset the phone. No response follows.
    pub async fn reset(&mut self) -> Result<()> {
        let body = make_frame(SW_RESET, &[]);
        self.transport.send(&encapsulate(&body)).await?;
        self.connected = false;
        Ok(())
    }

    /// Disable the debug tap and hand the transport back.
    pub async fn disconnect(mut self) -> Result<Box<dyn Transport>> {
        let _ = self.v24(false).await;
        Ok(self.transport)
    }
}

struct ChunkSource<'a> {
    client: &'a mut DwdClient,
}

#[async_trait]
impl BlockRead for ChunkSource<'_> {
    fn max_page_size(&self) -> usize {
        MAX_READ_CHUNK
    }

    async fn read_block(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.client.read_chunk(addr, buf).await
    }
}

struct ChunkSink<'a> {
    client: &'a mut DwdClient,
}

#[async_trait]
impl BlockWrite for ChunkSink<'_> {
    fn max_page_size(&self) -> usize {
        MAX_WRITE_CHUNK
    }

    async fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.client.write_chunk(addr, data).await
    }
}
