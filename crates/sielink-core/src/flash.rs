//! Flash-region arithmetic.
//!
//! A phone's flash is described as a sorted, non-overlapping sequence of
//! [`FlashRegion`]s (erase blocks). Writes must be partitioned along region
//! boundaries because the loader erases a whole region before programming
//! it; [`align_to_regions`] computes that partition and flags the chunks
//! that do not cover their region entirely (those need a read-modify-write
//! by the caller).

use crate::error::{Error, Result};

/// One erase block of flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegion {
    /// First address of the region.
    pub addr: u32,
    /// Region size in bytes.
    pub size: u32,
    /// Erase granularity for this region (usually equal to `size`).
    pub erase_size: u32,
}

impl FlashRegion {
    fn end(&self) -> u64 {
        self.addr as u64 + self.size as u64
    }

    fn contains(&self, addr: u32) -> bool {
        addr >= self.addr && (addr as u64) < self.end()
    }
}

/// One region-aligned piece of a write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionChunk {
    /// The region's own address.
    pub addr: u32,
    /// The region's own size.
    pub size: u32,
    /// Offset inside the region where the request's data lands.
    pub buffer_offset: u32,
    /// Number of request bytes landing in this region.
    pub buffer_size: u32,
    /// `true` when the request does not cover the whole region.
    pub is_partial: bool,
}

/// Partition the range `[addr, addr + size)` along region boundaries.
///
/// Regions must be sorted by address and non-overlapping. Returns one
/// chunk per touched region; the chunks' data windows tile the request
/// exactly. A zero-size request yields an empty partition. A request that
/// reaches outside the region map fails with [`Error::Alignment`].
pub fn align_to_regions(addr: u32, size: u32, regions: &[FlashRegion]) -> Result<Vec<RegionChunk>> {
    if size == 0 {
        return Ok(Vec::new());
    }

    let end = addr as u64 + size as u64;
    let mut chunks = Vec::new();
    let mut cursor = addr as u64;

    while cursor < end {
        let region = regions
            .iter()
            .find(|r| r.contains(cursor as u32))
            .ok_or_else(|| {
                Error::Alignment(format!(
                    "address {cursor:#010x} is outside the flash map"
                ))
            })?;

        let buffer_offset = (cursor - region.addr as u64) as u32;
        let span = (region.end().min(end) - cursor) as u32;
        chunks.push(RegionChunk {
            addr: region.addr,
            size: region.size,
            buffer_offset,
            buffer_size: span,
            is_partial: buffer_offset != 0 || span != region.size,
        });
        cursor += span as u64;
    }

    Ok(chunks)
}

/// Build a region list from erase-block group descriptors.
///
/// The CHAOS info record describes flash geometry as groups of
/// `(count, size_units)` pairs enumerating contiguously from the flash
/// base: each group contributes `count + 1` regions of
/// `size_units * 256` bytes.
pub fn regions_from_groups(flash_base: u32, groups: &[(u16, u16)]) -> Vec<FlashRegion> {
    let mut regions = Vec::new();
    let mut addr = flash_base;
    for &(count, size_units) in groups {
        let size = size_units as u32 * 256;
        for _ in 0..=count {
            regions.push(FlashRegion {
                addr,
                size,
                erase_size: size,
            });
            addr = addr.wrapping_add(size);
        }
    }
    regions
}
