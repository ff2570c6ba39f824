//! sielink-boot: Boot-ROM handshake and second-stage bootloader.
//!
//! Two protocols live here because one hands off to the other:
//!
//! - [`bsl`] -- the boot ROM's scan/upload handshake, with ignition (DTR)
//!   toggling and XOR-checked payload framing.
//! - [`ebl`] -- the checksummed packet protocol the uploaded second stage
//!   speaks (baud negotiation, external-bus setup, CFI flash probe).

pub mod bsl;
pub mod ebl;

pub use bsl::{boot, frame_payload, scan, upload, BslConfig, CpuType};
pub use ebl::{EblClient, EbuBank, EbuConfig, FlashCfi};
