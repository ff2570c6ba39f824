//! Small shared helpers used across protocol crates.

/// Format an address or length as the uppercase zero-padded 8-hex field
/// the CGSN command grammar uses.
pub fn hex32(value: u32) -> String {
    format!("{value:08X}")
}

/// XOR of a byte slice, the 8-bit checksum several boot protocols use.
pub fn xor8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Render a byte slice as spaced uppercase hex for log messages.
pub fn hexdump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex32_pads_and_uppercases() {
        assert_eq!(hex32(0xA0000000), "A0000000");
        assert_eq!(hex32(0x8), "00000008");
        assert_eq!(hex32(0xDEADBEEF), "DEADBEEF");
    }

    #[test]
    fn xor8_of_empty_is_zero() {
        assert_eq!(xor8(&[]), 0);
    }

    #[test]
    fn xor8_folds_all_bytes() {
        assert_eq!(xor8(&[0x01, 0x02, 0x04]), 0x07);
        assert_eq!(xor8(&[0xFF, 0xFF]), 0x00);
    }

    #[test]
    fn hexdump_spaces_bytes() {
        assert_eq!(hexdump(&[0x41, 0x54, 0x23]), "41 54 23");
        assert_eq!(hexdump(&[]), "");
    }
}
