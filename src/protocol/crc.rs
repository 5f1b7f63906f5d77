//! CRC-CCITT as used by the D-Star radio header
//!
//! Reflected polynomial 0x8408, initial value 0xFFFF, output complemented.
//! The radio header stores the result little-endian.

/// Reflected CRC-CCITT polynomial
pub const CRC_POLY: u16 = 0x8408;

/// Computes the radio header checksum of `data`
pub fn crc_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            crc = if crc & 0x0001 != 0 {
                (crc >> 1) ^ CRC_POLY
            } else {
                crc >> 1
            };
        }
    }
    !crc
}
