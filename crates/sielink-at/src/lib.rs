//! sielink-at: Line-framed AT command channel.
//!
//! Siemens service firmware multiplexes several higher protocols over an
//! ordinary AT command interface: CGSN tunnels memory operations through
//! custom command suffixes, DWD wraps binary frames in `AT#` envelopes,
//! and BFC is entered by an `AT^SQWE=1` switch. This crate provides the
//! shared command/response engine they all drive.
//!
//! # Key types
//!
//! - [`AtChannel`] -- the engine; owns the transport while running
//! - [`AtCommand`] / [`AtCommandKind`] -- one transaction and its
//!   line-dispatch rule
//! - [`AtResponse`] / [`AtStatus`] -- the assembled result

pub mod channel;
pub mod command;

pub use channel::{AtChannel, HANDSHAKE_COMMAND};
pub use command::{AtCommand, AtCommandKind, AtResponse, AtStatus};
