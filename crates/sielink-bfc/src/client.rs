//! High-level BFC client.
//!
//! Owns the transport-mode state machine (`none` / `at` / `bfc`): the raw
//! transport is held idle, attached to an [`AtChannel`] for the AT-side
//! connect sequence, or attached to the [`BfcBus`] engine for framed
//! traffic. Mode transitions move the boxed transport between the three
//! holders; nothing else ever touches the port.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, trace};

use sielink_at::{AtChannel, AtCommand, AtCommandKind};
use sielink_core::blockio::{read_blocks, BlockRead, ReadOutcome, Transfer};
use sielink_core::error::{Error, Result};
use sielink_core::transport::Transport;

use crate::bus::BfcBus;
use crate::display::{DisplayBuffer, DisplayBufferInfo, DisplayInfo};
use crate::frame::{BfcFrame, FrameType};
use crate::parser::{MemoryReadParser, ReplyParser};

/// Default local bus address; replies are routed by this.
const LOCAL_SRC: u8 = 0x11;

/// Service/status channel (ping, baud control).
const DST_SERVICE: u8 = 0x02;
/// Memory access channel.
const DST_MEMORY: u8 = 0x06;
/// Display service channel.
const DST_DISPLAY: u8 = 0x0D;

/// Auth/ping request payload.
const AUTH_REQUEST: [u8; 2] = [0x80, 0x11];
/// Leading bytes of an accepted auth reply.
const AUTH_OK: [u8; 2] = [0x43, 0x11];

/// Memory-read command byte on the memory channel.
const CMD_READ_MEMORY: u8 = 0x01;
/// Display-info request on the display channel.
const CMD_DISPLAY_INFO: u8 = 0x10;
/// Buffer-info request on the display channel.
const CMD_BUFFER_INFO: u8 = 0x11;

/// Baud-set command byte on the service channel.
const CMD_SET_BAUD: u8 = 0x02;
/// Leading bytes of a rejected baud-set reply.
const BAUD_REJECT: [u8; 2] = [0x02, 0xEE];

/// The AT-side connect sequence runs at this rate.
const AT_BAUD: u32 = 115_200;
/// Settle delay after `AT^SQWE=1` before the first framed exchange.
const SQWE_SETTLE: Duration = Duration::from_millis(300);
/// Baud rates probed when the phone is already in BFC mode.
const PROBE_BAUDS: [u32; 3] = [115_200, 230_400, 921_600];
/// Candidate rates for upward negotiation, tried best-first.
const NEGOTIATE_BAUDS: [u32; 3] = [921_600, 460_800, 230_400];

const PING_TIMEOUT: Duration = Duration::from_secs(1);
const EXEC_TIMEOUT: Duration = Duration::from_secs(3);
const MEMORY_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest memory window one read command may request.
const MEMORY_CHUNK: usize = 32 * 1024;

/// Which engine currently owns the serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// The client holds the raw transport.
    None,
    /// The AT channel owns the transport.
    At,
    /// The BFC bus engine owns the transport.
    Bfc,
}

enum ModeState {
    Idle(Box<dyn Transport>),
    At(AtChannel),
    Bfc(BfcBus),
    Gone,
}

/// Per-exec options mirroring the frame's control bits.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Frame type to send.
    pub frame_type: FrameType,
    /// Append a CRC trailer.
    pub crc: bool,
    /// Request a transport-level acknowledgement.
    pub ack: bool,
    /// Authenticate the destination channel first (cached per dst).
    pub auth: bool,
    /// Reply timeout.
    pub timeout: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        ExecOptions {
            frame_type: FrameType::Single,
            crc: true,
            ack: false,
            auth: false,
            timeout: EXEC_TIMEOUT,
        }
    }
}

/// High-level BFC client.
pub struct BfcClient {
    state: ModeState,
    src: u8,
    authed: HashSet<u8>,
}

impl BfcClient {
    /// Wrap a transport; the client starts in mode `None`.
    pub fn new(transport: Box<dyn Transport>) -> BfcClient {
        BfcClient {
            state: ModeState::Idle(transport),
            src: LOCAL_SRC,
            authed: HashSet::new(),
        }
    }

    /// Override the local bus address.
    pub fn with_src(mut self, src: u8) -> Self {
        self.src = src;
        self
    }

    /// The current transport mode.
    pub fn mode(&self) -> TransportMode {
        match self.state {
            ModeState::Idle(_) => TransportMode::None,
            ModeState::At(_) => TransportMode::At,
            ModeState::Bfc(_) => TransportMode::Bfc,
            ModeState::Gone => TransportMode::None,
        }
    }

    /// Tear down whatever engine is attached and hand the transport back.
    pub async fn disconnect(mut self) -> Result<Box<dyn Transport>> {
        self.to_idle().await?;
        match std::mem::replace(&mut self.state, ModeState::Gone) {
            ModeState::Idle(transport) => Ok(transport),
            _ => Err(Error::NotConnected),
        }
    }

    /// Establish a BFC session.
    ///
    /// First tries the AT-side switch at 115200: query `AT^SIFS` (a
    /// Bluetooth link cannot carry BFC), issue `AT^SQWE=1`, settle, and
    /// ping over the framed bus. If the phone does not answer AT at all it
    /// may already be in BFC mode; each candidate baud is then probed with
    /// status pings.
    pub async fn connect(&mut self) -> Result<()> {
        self.to_idle().await?;
        self.set_idle_baud(AT_BAUD).await?;
        self.enter_at()?;

        let at = self.at()?;
        if at.handshake(3).await.is_ok() {
            debug!("AT endpoint answered; switching it to BFC");
            let sifs = at
                .send(
                    AtCommand::new("AT^SIFS")
                        .kind(AtCommandKind::PrefixFiltered)
                        .prefix("^SIFS"),
                )
                .await?;
            if sifs.success && sifs.first_line().contains("BLUE") {
                self.to_idle().await?;
                return Err(Error::Unsupported(
                    "BFC over a Bluetooth link is not supported".into(),
                ));
            }

            let sqwe = at.send(AtCommand::new("AT^SQWE=1")).await?;
            if !sqwe.success {
                self.to_idle().await?;
                return Err(Error::Protocol(format!(
                    "AT^SQWE=1 rejected: {:?}",
                    sqwe.status
                )));
            }

            self.to_idle().await?;
            tokio::time::sleep(SQWE_SETTLE).await;
            self.enter_bfc()?;
            self.ping().await?;
            info!("BFC session established via AT switch");
            return Ok(());
        }

        // No AT endpoint; the phone may already speak BFC.
        debug!("AT handshake failed; probing for an open BFC session");
        self.to_idle().await?;
        for baud in PROBE_BAUDS {
            self.set_idle_baud(baud).await?;
            self.enter_bfc()?;
            for _ in 0..3 {
                if self.ping().await.is_ok() {
                    info!(baud, "found open BFC session");
                    return Ok(());
                }
            }
            self.to_idle().await?;
        }

        self.set_idle_baud(AT_BAUD).await?;
        Err(Error::Timeout)
    }

    /// Status ping on the service channel.
    pub async fn ping(&mut self) -> Result<()> {
        let frame = BfcFrame::status(DST_SERVICE, self.src, AUTH_REQUEST.to_vec());
        self.bus()?
            .exec(frame, self.src, ReplyParser::Single, PING_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// One framed request/response exchange.
    pub async fn exec(&mut self, dst: u8, payload: Vec<u8>, opts: ExecOptions) -> Result<Vec<u8>> {
        if opts.auth {
            self.ensure_auth(dst).await?;
        }
        let frame = BfcFrame {
            dst,
            src: self.src,
            frame_type: opts.frame_type,
            ack: opts.ack,
            crc: opts.crc,
            payload,
        };
        self.bus()?
            .exec(frame, self.src, ReplyParser::Single, opts.timeout)
            .await
    }

    /// Authenticate a destination channel once per connection.
    async fn ensure_auth(&mut self, dst: u8) -> Result<()> {
        if self.authed.contains(&dst) {
            return Ok(());
        }
        trace!(dst, "authenticating channel");
        let frame = BfcFrame::status(dst, self.src, AUTH_REQUEST.to_vec());
        let reply = self
            .bus()?
            .exec(frame, self.src, ReplyParser::Single, EXEC_TIMEOUT)
            .await?;
        if reply.len() < 2 || reply[0..2] != AUTH_OK {
            return Err(Error::AuthDenied);
        }
        self.authed.insert(dst);
        Ok(())
    }

    /// Bulk memory read through the block engine (32 KiB windows).
    pub async fn read_memory(
        &mut self,
        addr: u32,
        len: u32,
        transfer: &mut Transfer<'_>,
    ) -> Result<ReadOutcome> {
        self.ensure_auth(DST_MEMORY).await?;
        let mut channel = MemoryChannel {
            bus: self.bus()?,
            src: self.src,
        };
        read_blocks(&mut channel, addr, len, transfer).await
    }

    /// Ask the phone to switch line speed, then follow it.
    ///
    /// The request carries the rate in ASCII; a reply opening with
    /// `02 EE` is a rejection. After switching the local port the session
    /// is verified with up to three pings; failure restores the prior
    /// rate.
    pub async fn set_phone_baud(&mut self, baud: u32) -> Result<()> {
        let prior = self.bus()?.baud_rate().await?;

        let mut payload = vec![CMD_SET_BAUD];
        payload.extend_from_slice(baud.to_string().as_bytes());
        let frame = BfcFrame::status(DST_SERVICE, self.src, payload);
        let reply = self
            .bus()?
            .exec(frame, self.src, ReplyParser::Single, EXEC_TIMEOUT)
            .await?;
        if reply.len() >= 2 && reply[0..2] == BAUD_REJECT {
            return Err(Error::Protocol(format!("phone rejected baud rate {baud}")));
        }

        self.bus()?.set_baud_rate(baud).await?;
        for _ in 0..3 {
            if self.ping().await.is_ok() {
                debug!(baud, "phone followed baud change");
                return Ok(());
            }
        }

        self.bus()?.set_baud_rate(prior).await?;
        Err(Error::Timeout)
    }

    /// Negotiate the fastest working rate, best-first.
    ///
    /// Returns the rate in effect afterwards (unchanged when every
    /// candidate fails).
    pub async fn negotiate_baud(&mut self) -> Result<u32> {
        for baud in NEGOTIATE_BAUDS {
            if self.set_phone_baud(baud).await.is_ok() {
                return Ok(baud);
            }
        }
        self.bus()?.baud_rate().await
    }

    /// Capture a display's live framebuffer.
    pub async fn get_display_buffer(
        &mut self,
        display: u8,
        transfer: &mut Transfer<'_>,
    ) -> Result<DisplayBuffer> {
        let reply = self
            .exec(
                DST_DISPLAY,
                vec![CMD_DISPLAY_INFO, display],
                ExecOptions::default(),
            )
            .await?;
        let info = DisplayInfo::parse(&reply)?;

        let reply = self
            .exec(
                DST_DISPLAY,
                vec![CMD_BUFFER_INFO, display],
                ExecOptions::default(),
            )
            .await?;
        let buffer_info = DisplayBufferInfo::parse(&reply)?;

        let size = buffer_info
            .format
            .buffer_size(info.width as u32, info.height as u32);
        debug!(
            width = info.width,
            height = info.height,
            format = ?buffer_info.format,
            addr = format_args!("{:#010x}", buffer_info.addr),
            bytes = size,
            "reading framebuffer"
        );
        let outcome = self.read_memory(buffer_info.addr, size, transfer).await?;

        Ok(DisplayBuffer {
            width: info.width,
            height: info.height,
            format: buffer_info.format,
            data: outcome.buffer,
        })
    }

    // --- mode transitions ---------------------------------------------

    async fn to_idle(&mut self) -> Result<()> {
        let state = std::mem::replace(&mut self.state, ModeState::Gone);
        let transport = match state {
            ModeState::Idle(transport) => transport,
            ModeState::At(channel) => channel.stop().await?,
            ModeState::Bfc(bus) => {
                self.authed.clear();
                bus.stop().await?
            }
            ModeState::Gone => return Err(Error::NotConnected),
        };
        self.state = ModeState::Idle(transport);
        Ok(())
    }

    fn enter_at(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, ModeState::Gone) {
            ModeState::Idle(transport) => {
                self.state = ModeState::At(AtChannel::start(transport));
                Ok(())
            }
            other => {
                self.state = other;
                Err(Error::Protocol(
                    "mode transition requires the idle transport".into(),
                ))
            }
        }
    }

    fn enter_bfc(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, ModeState::Gone) {
            ModeState::Idle(transport) => {
                self.state = ModeState::Bfc(BfcBus::start(transport));
                Ok(())
            }
            other => {
                self.state = other;
                Err(Error::Protocol(
                    "mode transition requires the idle transport".into(),
                ))
            }
        }
    }

    async fn set_idle_baud(&mut self, baud: u32) -> Result<()> {
        match &mut self.state {
            ModeState::Idle(transport) => transport.set_baud_rate(baud).await,
            _ => Err(Error::Protocol(
                "baud change requires the idle transport".into(),
            )),
        }
    }

    fn at(&self) -> Result<&AtChannel> {
        match &self.state {
            ModeState::At(channel) => Ok(channel),
            _ => Err(Error::NotConnected),
        }
    }

    fn bus(&self) -> Result<&BfcBus> {
        match &self.state {
            ModeState::Bfc(bus) => Ok(bus),
            _ => Err(Error::NotConnected),
        }
    }
}

/// The memory channel's chunk primitive for the block engine.
struct MemoryChannel<'a> {
    bus: &'a BfcBus,
    src: u8,
}

#[async_trait]
impl BlockRead for MemoryChannel<'_> {
    fn max_page_size(&self) -> usize {
        MEMORY_CHUNK
    }

    async fn read_block(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(9);
        payload.push(CMD_READ_MEMORY);
        payload.extend_from_slice(&addr.to_le_bytes());
        payload.extend_from_slice(&(buf.len() as u32).to_le_bytes());

        let frame = BfcFrame::single(DST_MEMORY, self.src, payload);
        let data = self
            .bus
            .exec(
                frame,
                self.src,
                ReplyParser::MemoryRead(MemoryReadParser::new(buf.len())),
                MEMORY_TIMEOUT,
            )
            .await?;
        buf.copy_from_slice(&data);
        Ok(())
    }
}
