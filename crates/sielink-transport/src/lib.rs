//! sielink-transport: Serial transport implementation for sielink.
//!
//! Provides [`SerialTransport`], the `tokio-serial` backed implementation
//! of [`sielink_core::Transport`]. Protocol crates never depend on this
//! crate directly -- they consume the trait, which also lets the test
//! harness stand in for real hardware.

pub mod serial;

pub use serial::SerialTransport;
