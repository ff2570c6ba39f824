//! BSL boot-ROM handshake.
//!
//! When a Siemens phone powers up with the bootloader pins strapped, its
//! boot ROM listens on the serial line for the two-byte probe `AT` and
//! answers with a single CPU-identification byte. The host then uploads a
//! small second-stage payload (EBL, or the CHAOS loader) framed with a
//! length and an XOR trailer.
//!
//! Phones without a service cable need their ignition line pulsed to power
//! up during the scan; the DTR line stands in for the ignition button,
//! asserted 50 ms and released 150 ms per cycle. Cables differ in how the
//! line is wired, so the polarity can be inverted.
//!
//! BSL always runs at 115200 baud; configuring the port is the caller's
//! job.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use sielink_core::error::{Error, Result};
use sielink_core::helpers::xor8;
use sielink_core::transport::{read_byte, SerialSignals, Transport};

/// CPU identification bytes sent by the boot ROM during the scan.
const SCAN_ACK_SGOLD: u8 = 0xB0;
const SCAN_ACK_EGOLD: u8 = 0xC0;

/// Payload acknowledgement bytes.
const LOAD_ACK_SGOLD: u8 = 0xB1;
const LOAD_ACK_EGOLD: u8 = 0xC1;
const LOAD_DENIED_SGOLD: u8 = 0x1B;
const LOAD_DENIED_EGOLD: u8 = 0x1C;

/// Frame marker opening a payload upload.
const PAYLOAD_MARKER: u8 = 0x30;

/// DTR assertion period within one ignition cycle.
const IGNITION_ON: Duration = Duration::from_millis(50);
/// DTR release period within one ignition cycle.
const IGNITION_OFF: Duration = Duration::from_millis(150);

/// How long to wait for the payload acknowledgement byte.
const LOAD_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// The CPU family identified by the boot ROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuType {
    /// S-GOLD family (replies `0xB0`/`0xB1`).
    Sgold,
    /// E-GOLD family (replies `0xC0`/`0xC1`).
    Egold,
}

/// Scan configuration.
#[derive(Debug, Clone)]
pub struct BslConfig {
    /// Pulse DTR as the ignition line while scanning.
    pub toggle_ignition: bool,
    /// Flip the DTR sense for cables wired the other way around.
    pub invert_polarity: bool,
    /// Give up scanning after this long.
    pub scan_timeout: Duration,
}

impl Default for BslConfig {
    fn default() -> Self {
        BslConfig {
            toggle_ignition: true,
            invert_polarity: false,
            scan_timeout: Duration::from_secs(30),
        }
    }
}

/// Scan for boot-ROM presence.
///
/// Repeatedly sends the `AT` probe (optionally pulsing the ignition line)
/// until a CPU-identification byte arrives. Returns the identified CPU,
/// [`Error::Timeout`] when the scan window closes, or [`Error::Cancelled`]
/// when the token fires.
pub async fn scan(
    transport: &mut (dyn Transport + '_),
    config: &BslConfig,
    cancel: &CancellationToken,
) -> Result<CpuType> {
    let deadline = Instant::now() + config.scan_timeout;
    debug!(
        toggle = config.toggle_ignition,
        invert = config.invert_polarity,
        "scanning for boot ROM"
    );

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout);
        }

        transport.send(b"AT").await?;

        if config.toggle_ignition {
            let asserted = !config.invert_polarity;
            transport.set_signals(SerialSignals::dtr(asserted)).await?;
            if let Some(cpu) = probe(transport, IGNITION_ON, cancel).await? {
                transport.set_signals(SerialSignals::dtr(!asserted)).await?;
                return Ok(cpu);
            }
            transport.set_signals(SerialSignals::dtr(!asserted)).await?;
            if let Some(cpu) = probe(transport, IGNITION_OFF, cancel).await? {
                return Ok(cpu);
            }
        } else if let Some(cpu) = probe(transport, IGNITION_ON + IGNITION_OFF, cancel).await? {
            return Ok(cpu);
        }
    }
}

/// Wait up to `window` for a CPU-identification byte.
async fn probe(
    transport: &mut (dyn Transport + '_),
    window: Duration,
    cancel: &CancellationToken,
) -> Result<Option<CpuType>> {
    let deadline = Instant::now() + window;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        match read_byte(transport, deadline - now).await? {
            Some(SCAN_ACK_SGOLD) => {
                debug!("boot ROM answered: S-GOLD");
                return Ok(Some(CpuType::Sgold));
            }
            Some(SCAN_ACK_EGOLD) => {
                debug!("boot ROM answered: E-GOLD");
                return Ok(Some(CpuType::Egold));
            }
            Some(other) => {
                // Line noise during power-up is common; keep scanning.
                trace!(byte = format_args!("{other:#04x}"), "ignoring stray byte");
            }
            None => return Ok(None),
        }
    }
}

/// Frame a boot payload for the wire.
///
/// `0x30 | len:u16le | code | xor8(code)`.
pub fn frame_payload(code: &[u8]) -> Result<Vec<u8>> {
    if code.is_empty() || code.len() > u16::MAX as usize {
        return Err(Error::Protocol(format!(
            "boot payload of {} bytes cannot be framed",
            code.len()
        )));
    }
    let mut frame = Vec::with_capacity(code.len() + 4);
    frame.push(PAYLOAD_MARKER);
    frame.extend_from_slice(&(code.len() as u16).to_le_bytes());
    frame.extend_from_slice(code);
    frame.push(xor8(code));
    Ok(frame)
}

/// Upload a boot payload and wait for the acknowledgement byte.
///
/// The boot ROM must already have been found by [`scan`]. `0xB1`/`0xC1`
/// accept the payload (and re-identify the CPU); `0x1B`/`0x1C` are
/// [`Error::Denied`]; anything else is a protocol violation; silence for
/// one second is [`Error::Timeout`].
pub async fn upload(
    transport: &mut (dyn Transport + '_),
    code: &[u8],
    cancel: &CancellationToken,
) -> Result<CpuType> {
    let frame = frame_payload(code)?;
    debug!(bytes = code.len(), "uploading boot payload");
    transport.send(&frame).await?;

    let ack = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        b = read_byte(transport, LOAD_ACK_TIMEOUT) => b?,
    };

    match ack {
        Some(LOAD_ACK_SGOLD) => Ok(CpuType::Sgold),
        Some(LOAD_ACK_EGOLD) => Ok(CpuType::Egold),
        Some(code @ (LOAD_DENIED_SGOLD | LOAD_DENIED_EGOLD)) => Err(Error::Denied(code)),
        Some(other) => Err(Error::Protocol(format!(
            "unknown boot acknowledgement {other:#04x}"
        ))),
        None => Err(Error::Timeout),
    }
}

/// Scan for the boot ROM, then upload the payload.
pub async fn boot(
    transport: &mut (dyn Transport + '_),
    code: &[u8],
    config: &BslConfig,
    cancel: &CancellationToken,
) -> Result<CpuType> {
    scan(transport, config, cancel).await?;
    upload(transport, code, cancel).await
}
