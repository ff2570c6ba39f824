//! sielink-dwd: The DWD debug protocol for APOXI phones.
//!
//! DWD is a binary debug protocol tunneled inside quoted AT lines: each
//! frame is escaped so the carriage return appears only as the line
//! terminator, prefixed with an `AT#` marker and an escape map. Access
//! is gated by a keyed two-stage handshake.
//!
//! - [`envelope`] -- the escape/unescape codec
//! - [`frame`] -- opcodes and length rules
//! - [`keys`] -- built-in keysets and the handshake arithmetic
//! - [`client`] -- V24 toggle, handshake, memory I/O, version, reset
//! - [`bruteforce`] -- key2 scanning and key1 recovery
//! - [`regions`] -- memory-map discovery through the EBU registers

pub mod bruteforce;
pub mod client;
pub mod envelope;
pub mod frame;
pub mod keys;
pub mod regions;
#[cfg(test)]
pub(crate) mod testutil;

pub use bruteforce::{bruteforce_key1, bruteforce_key2};
pub use client::{DwdClient, MAX_READ_CHUNK, MAX_WRITE_CHUNK};
pub use envelope::{decapsulate, encapsulate};
pub use keys::{builtin_keysets, find_keyset, Keyset, AUTO};
pub use regions::{discover_regions, MemoryRegion};
