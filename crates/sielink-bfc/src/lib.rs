//! sielink-bfc: The BFC multiplexed framed service bus.
//!
//! BFC carries service commands over per-destination channels multiplexed
//! on one serial line. Frames carry a header XOR checkpoint and an
//! optional CRC-16 trailer; receivers resynchronise across line noise.
//!
//! The crate is layered like the bus itself:
//!
//! - [`crc`] / [`frame`] -- the byte-level codec
//! - [`parser`] -- streaming multi-frame reply assembly
//! - [`bus`] -- the engine task: receiver slots per destination,
//!   auto-ACK, timeouts
//! - [`client`] -- connect sequence, auth cache, memory reads, baud
//!   negotiation, display capture
//! - [`display`] -- framebuffer records and pixel formats

pub mod bus;
pub mod client;
pub mod crc;
pub mod display;
pub mod frame;
pub mod parser;

pub use bus::BfcBus;
pub use client::{BfcClient, ExecOptions, TransportMode};
pub use crc::crc16;
pub use display::{DisplayBuffer, DisplayBufferInfo, DisplayInfo, PixelFormat};
pub use frame::{BfcFrame, DecodeResult, FrameType};
pub use parser::{MemoryReadParser, ReplyParser};
