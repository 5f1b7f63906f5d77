//! Slow-data scrambler
//!
//! D-Star XORs each 3-byte data field with the head of a fixed keystream
//! produced by the LFSR x^7 + x^4 + 1 seeded with all ones. Only the first
//! nine bytes are ever needed because every data field restarts the stream.

/// Keystream bytes, LFSR output packed LSB first
pub const SCRAMBLER_KEY: [u8; 9] = [0x70, 0x4F, 0x93, 0x40, 0x64, 0x74, 0x6D, 0x30, 0x2B];

/// XORs the keystream over at most the first nine bytes of `buf`
pub fn scramble(buf: &mut [u8]) {
    for (byte, key) in buf.iter_mut().zip(SCRAMBLER_KEY.iter()) {
        *byte ^= key;
    }
}

/// Inverse of [`scramble`], which is its own inverse
pub fn descramble(buf: &mut [u8]) {
    scramble(buf)
}
