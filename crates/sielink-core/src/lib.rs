//! sielink-core: Core traits, types, and the block I/O engine for sielink.
//!
//! This crate defines the protocol-agnostic abstractions every sielink
//! protocol driver builds on. Applications depend on these types without
//! pulling in any specific protocol crate.
//!
//! # Key types
//!
//! - [`Transport`] -- byte-level serial channel with timeout, signals, and
//!   baud control
//! - [`blockio`] -- the retrying, adaptive, progress-reporting bulk
//!   transfer engine
//! - [`flash`] -- flash-region partitioning arithmetic
//! - [`Error`] / [`Result`] -- error handling

pub mod blockio;
pub mod error;
pub mod flash;
pub mod helpers;
pub mod transport;

// Re-export key types at crate root for ergonomic `use sielink_core::*`.
pub use blockio::{
    read_blocks, write_blocks, AdaptivePolicy, BlockRead, BlockWrite, Progress, ReadOutcome,
    Transfer, TransferPolicy, WriteOutcome,
};
pub use error::{Error, Result};
pub use flash::{align_to_regions, regions_from_groups, FlashRegion, RegionChunk};
pub use transport::{drain, read_byte, read_exact, SerialSignals, Transport};
