//! sielink-chaos: The CHAOS resident-loader flasher protocol.
//!
//! CHAOS is a small loader uploaded through BSL into phone RAM; once it
//! announces itself it serves flash and RAM access over its own binary
//! command set. The loader drops out of its command state without
//! traffic, so the session keeps a 250 ms heartbeat running between
//! requests.
//!
//! - [`protocol`] -- opcodes, page codecs, the 128-byte info record
//! - [`client`] -- boot/attach, the heartbeat engine task, bulk I/O with
//!   the loader's adaptive paging profile

pub mod client;
pub mod protocol;

pub use client::{ChaosClient, ChaosConfig, LOADER_IMAGE};
pub use protocol::ChaosInfo;
