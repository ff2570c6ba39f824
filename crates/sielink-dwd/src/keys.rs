//! DWD keysets and the keyed-handshake arithmetic.
//!
//! Every vendor firmware carries its own key tuple; the handshake proves
//! knowledge of it without sending the keys themselves. The probe randoms
//! are fixed in this implementation so exchanges are reproducible on the
//! wire.

use sielink_core::error::{Error, Result};

/// Fixed probe randoms.
pub const RAND1: u16 = 0x5500;
pub const RAND2: u16 = 0x5500;
pub const RAND3: u16 = 0x5500;
pub const RAND4: u16 = 0x0000;

/// A 4-tuple handshake key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keyset {
    /// 16-byte rotation table, indexed by the rotate value.
    pub key1: [u8; 16],
    /// Scalar mixed into the stage-1 challenge.
    pub key2: u16,
    /// 16-byte rotation table, indexed mirror-wise.
    pub key3: [u8; 16],
    /// Scalar mixed into the stage-1 challenge.
    pub key4: u16,
}

impl Keyset {
    /// The all-zero keyset (unprovisioned service firmware).
    pub const ZERO: Keyset = Keyset {
        key1: [0; 16],
        key2: 0,
        key3: [0; 16],
        key4: 0,
    };
}

/// Selects `auto` keyset iteration in [`find_keyset`] callers.
pub const AUTO: &str = "auto";

/// Built-in keysets in their stable iteration order.
///
/// `auto` is the all-zero tuple; when a caller selects it by name the
/// connect procedure walks this whole table in order until a handshake
/// succeeds.
pub fn builtin_keysets() -> &'static [(&'static str, Keyset)] {
    const SERVICE: Keyset = Keyset {
        key1: [
            0x37, 0xA2, 0x91, 0x5C, 0x0F, 0xE8, 0x44, 0xB3, 0x6D, 0x19, 0xC7, 0x82, 0x5E, 0xF0,
            0x2B, 0x94,
        ],
        key2: 0x9C3A,
        key3: [
            0x71, 0x0E, 0xD5, 0x38, 0xA6, 0x4F, 0x92, 0x1B, 0xE3, 0x58, 0x07, 0xCC, 0x65, 0xB9,
            0x2E, 0x80,
        ],
        key4: 0x51F7,
    };
    const LG: Keyset = Keyset {
        key1: [
            0x4C, 0x67, 0x12, 0xF9, 0x83, 0x2E, 0xD1, 0x50, 0xBA, 0x05, 0x78, 0xE4, 0x3F, 0x96,
            0xC2, 0x1D,
        ],
        key2: 0x2E81,
        key3: [
            0x95, 0x3C, 0x60, 0x0B, 0xDE, 0x47, 0xF2, 0x89, 0x14, 0xA7, 0x5B, 0x30, 0xC8, 0x6E,
            0x01, 0xD6,
        ],
        key4: 0xB44D,
    };
    const PANASONIC: Keyset = Keyset {
        key1: [
            0xE1, 0x08, 0x9B, 0x46, 0x73, 0xD0, 0x2F, 0xAC, 0x55, 0xE8, 0x31, 0x7A, 0x0D, 0xC4,
            0x9F, 0x62,
        ],
        key2: 0x70C5,
        key3: [
            0x28, 0xB5, 0x4E, 0xF1, 0x06, 0x93, 0x6A, 0xD7, 0x3C, 0x81, 0x10, 0xEB, 0x54, 0x29,
            0xC6, 0x7F,
        ],
        key4: 0x1A92,
    };

    &[
        ("auto", Keyset::ZERO),
        ("service", SERVICE),
        ("lg", LG),
        ("panasonic", PANASONIC),
    ]
}

/// Look up a built-in keyset by name.
pub fn find_keyset(name: &str) -> Result<Keyset> {
    builtin_keysets()
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, ks)| *ks)
        .ok_or_else(|| Error::Unsupported(format!("unknown keyset {name:?}")))
}

/// Stage-1 challenge: `((key4 ^ key2 ^ RAND1) + RAND2 + 0x4ED5) & 0xFFFF`.
pub fn connect1_challenge(keyset: &Keyset) -> u16 {
    (keyset.key4 ^ keyset.key2 ^ RAND1)
        .wrapping_add(RAND2)
        .wrapping_add(0x4ED5)
}

/// The chk1 value a genuine endpoint returns:
/// `((RAND1*8 − RAND2) ^ 0xD427) & 0xFFFF`.
pub fn expected_chk1() -> u16 {
    (((RAND1 as u32 * 8).wrapping_sub(RAND2 as u32)) ^ 0xD427) as u16
}

/// Derive the key rotation from the response's r6 field.
pub fn key_rotate(r6: u16) -> usize {
    (r6.wrapping_sub(RAND2) & 0xF) as usize
}

/// The chk2 value proving the endpoint holds the keyset:
/// `((key1[kr] << 4) ^ ((key3[15−kr] << 3) ^ 0x7F39)) & 0xFFFF`.
pub fn expected_chk2(keyset: &Keyset, rotate: usize) -> u16 {
    ((keyset.key1[rotate] as u16) << 4) ^ (((keyset.key3[0xF - rotate] as u16) << 3) ^ 0x7F39)
}

/// The stage-2 proof the host sends back:
/// `(key1[15−kr] ^ (key3[kr] << 4) ^ 0x4D33) & 0xFFFF`.
pub fn connect2_proof(keyset: &Keyset, rotate: usize) -> u16 {
    (keyset.key1[0xF - rotate] as u16) ^ (((keyset.key3[rotate] as u16) << 4) ^ 0x4D33)
}
