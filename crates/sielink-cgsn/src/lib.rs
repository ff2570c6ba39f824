//! sielink-cgsn: Memory and register operations over AT commands.
//!
//! The CGSN firmware patch turns the stock `AT+CGSN` identity command
//! into a memory peek/poke/execute interface with binary replies. This
//! crate builds the command grammar ([`commands`]) and drives a
//! [`sielink_at::AtChannel`] through the connect sequence and bulk
//! transfers ([`client`]).

pub mod client;
pub mod commands;

pub use client::CgsnClient;
pub use commands::{choose_baud, parse_ipr_response, CpuState, MAX_READ, MAX_WRITE};
