//! Memory-region discovery through the external bus controller.
//!
//! APOXI phones expose their bus layout in the EBU's address-select and
//! bus-configuration registers. Reading those over DWD yields a map of
//! flash and RAM ranges without any model database: chip selects decoding
//! into the `0xA...` window are flash, SDRAM controllers (`AGEN` 3 or 4)
//! are RAM, and the core-local TCM/SRAM ranges are fixed.

use tracing::debug;

use sielink_core::error::Result;

use crate::client::DwdClient;

/// The EBU identification register.
pub const EBU_ID_ADDR: u32 = 0xF000_0008;

/// ADDRSEL registers on old controllers (revision < 8): stride 8, BUSCON
/// follows each ADDRSEL.
const ADDRSEL_BASE_OLD: u32 = 0xF000_0080;
/// ADDRSEL registers on newer controllers: stride 4, BUSCON in its own
/// bank.
const ADDRSEL_BASE_NEW: u32 = 0xF000_0020;
const BUSCON_BASE_NEW: u32 = 0xF000_0060;

/// One discovered address range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Classified name (`FLASH`, `RAM`, `TCM`, `SRAM`, `EBU`), suffixed
    /// when the map holds several of a kind.
    pub name: String,
    /// First address of the range.
    pub base: u32,
    /// Range size in bytes.
    pub size: u32,
}

/// Decode an ADDRSEL register into `(base, size)`; `None` when the chip
/// select is disabled.
pub fn decode_addrsel(addrsel: u32) -> Option<(u32, u32)> {
    if addrsel & 1 == 0 {
        return None;
    }
    let base = addrsel & 0xFFFF_F000;
    let size = 1u32 << (27 - ((addrsel >> 4) & 0xF));
    Some((base, size))
}

/// The address-generation mode of a BUSCON register.
fn agen(buscon: u32) -> u32 {
    (buscon >> 28) & 0x7
}

/// Classify a decoded chip select.
pub fn classify(base: u32, buscon: u32) -> &'static str {
    if (0xA000_0000..=0xAFFF_FFFF).contains(&base) {
        "FLASH"
    } else if matches!(agen(buscon), 3 | 4) {
        "RAM"
    } else {
        "EBU"
    }
}

/// Sort, merge contiguous same-name ranges, and suffix duplicate names.
pub fn merge_regions(mut regions: Vec<MemoryRegion>) -> Vec<MemoryRegion> {
    regions.sort_by_key(|r| r.base);

    let mut merged: Vec<MemoryRegion> = Vec::with_capacity(regions.len());
    for region in regions {
        match merged.last_mut() {
            Some(prev)
                if prev.name == region.name
                    && prev.base.wrapping_add(prev.size) == region.base =>
            {
                prev.size += region.size;
            }
            _ => merged.push(region),
        }
    }

    // Duplicate names get a 1-based suffix in address order.
    let mut totals: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
    for region in &merged {
        *totals.entry(region.name.clone()).or_default() += 1;
    }
    let mut seen: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
    for region in &mut merged {
        if totals[&region.name] > 1 {
            let n = seen.entry(region.name.clone()).or_default();
            *n += 1;
            region.name = format!("{}{}", region.name, n);
        }
    }
    merged
}

/// Read the EBU registers and build the memory map.
pub async fn discover_regions(client: &mut DwdClient) -> Result<Vec<MemoryRegion>> {
    let id = client.read_word(EBU_ID_ADDR).await?;
    let revision = id & 0xFF;
    debug!(
        id = format_args!("{id:#010x}"),
        revision, "reading EBU chip selects"
    );

    let mut regions = vec![
        MemoryRegion {
            name: "TCM".into(),
            base: 0xFFFF_0000,
            size: 16 * 1024,
        },
        MemoryRegion {
            name: "SRAM".into(),
            base: 0,
            size: 96 * 1024,
        },
    ];

    for i in 0..4u32 {
        let (addrsel_addr, buscon_addr) = if revision < 8 {
            (ADDRSEL_BASE_OLD + i * 8, ADDRSEL_BASE_OLD + i * 8 + 4)
        } else {
            (ADDRSEL_BASE_NEW + i * 4, BUSCON_BASE_NEW + i * 4)
        };
        let addrsel = client.read_word(addrsel_addr).await?;
        let buscon = client.read_word(buscon_addr).await?;

        if let Some((base, size)) = decode_addrsel(addrsel) {
            let name = classify(base, buscon);
            debug!(
                cs = i,
                name,
                base = format_args!("{base:#010x}"),
                size,
                "chip select enabled"
            );
            regions.push(MemoryRegion {
                name: name.into(),
                base,
                size,
            });
        }
    }

    Ok(merge_regions(regions))
}
