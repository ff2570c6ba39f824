//! # sielink -- Serial service protocols for legacy Siemens phones
//!
//! `sielink` is an asynchronous Rust library speaking the service and
//! debug protocols of Siemens mobile phones over one serial line: the
//! AT command channel, the BFC framed service bus, the CGSN memory
//! patch, the BSL/EBL bootloaders, the DWD debug tunnel, and the CHAOS
//! resident flasher.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! sielink = "0.1"
//! tokio = { version = "1", features = ["full"] }
//! ```
//!
//! Capture a phone's display over BFC:
//!
//! ```no_run
//! use sielink::transport::SerialTransport;
//! use sielink::bfc::BfcClient;
//! use sielink::core::{Transfer, TransferPolicy};
//!
//! #[tokio::main]
//! async fn main() -> sielink::Result<()> {
//!     let transport = SerialTransport::open("/dev/ttyUSB0", 115_200).await?;
//!     let mut client = BfcClient::new(Box::new(transport));
//!     client.connect().await?;
//!
//!     let mut transfer = Transfer::new(TransferPolicy::default());
//!     let shot = client.get_display_buffer(0, &mut transfer).await?;
//!     println!("{}x{} {:?}", shot.width, shot.height, shot.format);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized as a workspace of focused crates:
//!
//! | Crate                  | Purpose                                       |
//! |------------------------|-----------------------------------------------|
//! | `sielink-core`         | `Transport` trait, errors, block I/O engine   |
//! | `sielink-transport`    | Serial port implementation (`tokio-serial`)   |
//! | `sielink-at`           | AT command channel with unsolicited dispatch  |
//! | `sielink-boot`         | BSL boot-ROM handshake + EBL second stage     |
//! | `sielink-bfc`          | BFC framed service bus                        |
//! | `sielink-cgsn`         | CGSN AT-hosted memory operations              |
//! | `sielink-dwd`          | DWD debug tunnel (APOXI)                      |
//! | `sielink-chaos`        | CHAOS resident-loader flasher                 |
//! | **`sielink`**          | This facade crate -- re-exports everything    |
//!
//! Every protocol drives the [`core::Transport`] trait rather than a
//! concrete port, so the `sielink-test-harness` mocks stand in for
//! hardware in tests.
//!
//! ## Feature Flags
//!
//! Each protocol backend is gated behind a feature flag, all on by
//! default: `bfc`, `cgsn`, `dwd`, `chaos`, `boot`.
//!
//! ## Bulk transfers
//!
//! Memory-capable protocols share one block engine
//! ([`core::read_blocks`] / [`core::write_blocks`]) providing retry,
//! adaptive page shrinking, cancellation with partial results, and
//! progress reporting. See [`core::Transfer`].

pub use sielink_core as core;
pub use sielink_core::{Error, Result};

pub use sielink_at as at;
pub use sielink_transport as transport;

#[cfg(feature = "bfc")]
pub use sielink_bfc as bfc;
#[cfg(feature = "boot")]
pub use sielink_boot as boot;
#[cfg(feature = "cgsn")]
pub use sielink_cgsn as cgsn;
#[cfg(feature = "chaos")]
pub use sielink_chaos as chaos;
#[cfg(feature = "dwd")]
pub use sielink_dwd as dwd;
