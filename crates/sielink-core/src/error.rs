//! Error types for sielink.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, protocol-layer, and
//! integrity errors are all captured here.

/// The error type for all sielink operations.
///
/// Variants cover the full range of failure modes encountered when talking
/// to a phone over its serial service interfaces: physical transport
/// failures, malformed frames, checksum mismatches, rejected handshakes,
/// and caller mistakes such as misaligned addresses.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (serial port driver, USB adapter).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (bad frame type, unexpected opcode, wrong
    /// start/end token, malformed response line).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out waiting for an expected byte, line, or frame.
    ///
    /// This typically indicates the phone is powered off, the baud rate is
    /// wrong, or the firmware does not speak the protocol being tried.
    #[error("timeout waiting for response")]
    Timeout,

    /// A checksum, CRC, or header-XOR did not match the received data.
    #[error("integrity failure: expected {expected:#06x}, got {actual:#06x}")]
    Integrity {
        /// The checksum value the sender claimed.
        expected: u32,
        /// The checksum value computed over the received bytes.
        actual: u32,
    },

    /// The remote endpoint rejected an authentication exchange.
    #[error("authentication denied")]
    AuthDenied,

    /// The boot ROM rejected the uploaded payload.
    ///
    /// The byte is the raw rejection code from the wire (`0x1B` or `0x1C`).
    #[error("boot payload denied (code {0:#04x})")]
    Denied(u8),

    /// A caller-supplied address or length violates the protocol's
    /// alignment rules. This is a usage error and is never retried.
    #[error("alignment error: {0}")]
    Alignment(String),

    /// The operation was cancelled by the caller's cancellation handle.
    ///
    /// Bulk transfers do not surface this variant; they return a partial
    /// outcome with the `canceled` flag set instead.
    #[error("operation cancelled")]
    Cancelled,

    /// The requested operation is not supported by this phone or firmware
    /// (BFC over Bluetooth, an unknown display format, a missing patch).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// No connection has been established, or the port was already closed.
    #[error("not connected")]
    NotConnected,

    /// The connection to the phone was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` for errors the block I/O engine may retry.
    ///
    /// Transport loss, cancellation, and alignment violations are final:
    /// retrying cannot change the outcome.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::NotConnected | Error::ConnectionLost | Error::Cancelled | Error::Alignment(_)
        )
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
