//! Transport trait for phone communication.
//!
//! The [`Transport`] trait abstracts over the serial link to a phone.
//! Implementations exist for real serial ports (`sielink-transport`) and
//! mock transports for testing (`sielink-test-harness`).
//!
//! Protocol engines (the BFC bus, the AT channel, the CHAOS loader client)
//! operate on a `Transport` rather than directly on a serial port, enabling
//! both real hardware control and deterministic unit testing.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Desired state of the serial modem-control lines.
///
/// `None` fields are left untouched. BSL uses DTR as the ignition line;
/// nothing in this library drives RTS, but adapters differ and callers may
/// need it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerialSignals {
    /// Data Terminal Ready.
    pub dtr: Option<bool>,
    /// Request To Send.
    pub rts: Option<bool>,
}

impl SerialSignals {
    /// Signals with only DTR set to the given level.
    pub fn dtr(on: bool) -> Self {
        SerialSignals {
            dtr: Some(on),
            rts: None,
        }
    }
}

/// Asynchronous byte-level transport to a phone.
///
/// Implementations handle the physical layer only. Framing, checksums, and
/// request/response pairing are the protocol engines' concern.
///
/// Exactly one read may be outstanding at a time per transport; callers
/// must serialize. Every protocol in this workspace does so by giving one
/// logical task exclusive ownership of the transport for the duration of a
/// request/response cycle.
#[async_trait]
pub trait Transport: Send {
    /// Send raw bytes to the phone.
    ///
    /// Implementations should not return until all bytes have been handed
    /// to the driver's TX path. There is no byte-level acknowledgement;
    /// higher layers impose their own ACK windows.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the phone into the provided buffer.
    ///
    /// Returns the number of bytes actually read. Waits up to `timeout`
    /// for data to arrive; returns [`Error::Timeout`] if nothing arrives
    /// within the deadline.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Set the modem-control lines.
    async fn set_signals(&mut self, signals: SerialSignals) -> Result<()>;

    /// Change the local baud rate.
    ///
    /// Protocols call this after negotiating a new rate with the phone;
    /// the remote side must already have switched (or be about to).
    async fn set_baud_rate(&mut self, baud: u32) -> Result<()>;

    /// The currently configured baud rate.
    fn baud_rate(&self) -> u32;

    /// Close the transport.
    ///
    /// After `close()`, every other method returns [`Error::NotConnected`].
    async fn close(&mut self) -> Result<()>;

    /// Whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}

/// Read exactly `buf.len()` bytes, or fewer if the deadline passes or the
/// transport closes first.
///
/// Returns the number of bytes placed in `buf`. A short return therefore
/// means timeout or close, never an error; driver failures still surface
/// as `Err`.
pub async fn read_exact(
    transport: &mut (dyn Transport + '_),
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize> {
    let deadline = Instant::now() + timeout;
    let mut filled = 0usize;

    while filled < buf.len() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let remaining = deadline - now;
        match transport.receive(&mut buf[filled..], remaining).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(Error::Timeout) => break,
            Err(Error::NotConnected) | Err(Error::ConnectionLost) if filled > 0 => break,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}

/// Read a single byte, or `None` if nothing arrives within `timeout`.
pub async fn read_byte(
    transport: &mut (dyn Transport + '_),
    timeout: Duration,
) -> Result<Option<u8>> {
    let mut buf = [0u8; 1];
    match read_exact(transport, &mut buf, timeout).await? {
        0 => Ok(None),
        _ => Ok(Some(buf[0])),
    }
}

/// Read and discard up to `max` bytes inside a quiet window.
///
/// Used to flush stale bytes before or after out-of-band commands (the DWD
/// V24 toggle). Returns how many bytes were discarded.
pub async fn drain(
    transport: &mut (dyn Transport + '_),
    max: usize,
    window: Duration,
) -> Result<usize> {
    let mut scratch = vec![0u8; max];
    read_exact(transport, &mut scratch, window).await
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal in-memory transport for exercising the read helpers.
    struct ChunkedTransport {
        chunks: Vec<Vec<u8>>,
        connected: bool,
    }

    #[async_trait]
    impl Transport for ChunkedTransport {
        async fn send(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            if !self.connected {
                return Err(Error::NotConnected);
            }
            if self.chunks.is_empty() {
                return Err(Error::Timeout);
            }
            let chunk = self.chunks.remove(0);
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            Ok(n)
        }

        async fn set_signals(&mut self, _signals: SerialSignals) -> Result<()> {
            Ok(())
        }

        async fn set_baud_rate(&mut self, _baud: u32) -> Result<()> {
            Ok(())
        }

        fn baud_rate(&self) -> u32 {
            115_200
        }

        async fn close(&mut self) -> Result<()> {
            self.connected = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    #[tokio::test]
    async fn read_exact_assembles_fragments() {
        let mut t = ChunkedTransport {
            chunks: vec![vec![0x01, 0x02], vec![0x03], vec![0x04, 0x05]],
            connected: true,
        };
        let mut buf = [0u8; 5];
        let n = read_exact(&mut t, &mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(buf, [0x01, 0x02, 0x03, 0x04, 0x05]);
    }

    #[tokio::test]
    async fn read_exact_short_on_timeout() {
        let mut t = ChunkedTransport {
            chunks: vec![vec![0xAA]],
            connected: true,
        };
        let mut buf = [0u8; 4];
        let n = read_exact(&mut t, &mut buf, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf[0], 0xAA);
    }

    #[tokio::test]
    async fn read_exact_propagates_disconnect() {
        let mut t = ChunkedTransport {
            chunks: vec![],
            connected: false,
        };
        let mut buf = [0u8; 1];
        let result = read_exact(&mut t, &mut buf, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn read_byte_some_and_none() {
        let mut t = ChunkedTransport {
            chunks: vec![vec![0xB0]],
            connected: true,
        };
        let b = read_byte(&mut t, Duration::from_millis(20)).await.unwrap();
        assert_eq!(b, Some(0xB0));
        let b = read_byte(&mut t, Duration::from_millis(20)).await.unwrap();
        assert_eq!(b, None);
    }

    #[tokio::test]
    async fn drain_counts_discarded_bytes() {
        let mut t = ChunkedTransport {
            chunks: vec![vec![1, 2, 3], vec![4]],
            connected: true,
        };
        let n = drain(&mut t, 32, Duration::from_millis(20)).await.unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn serial_signals_dtr_helper() {
        let s = SerialSignals::dtr(true);
        assert_eq!(s.dtr, Some(true));
        assert_eq!(s.rts, None);
    }
}
