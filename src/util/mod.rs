//! Utility module
//!
//! This module provides common utilities and helper functions used
//! throughout the library.

use std::time::Duration;

/// Copies `text` into a fixed-width field, space padded and truncated to `N` bytes
pub fn space_padded<const N: usize>(text: &str) -> [u8; N] {
    let mut field = [b' '; N];
    let bytes = text.as_bytes();
    let len = bytes.len().min(N);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

/// Renders a fixed-width text field without its trailing padding
pub fn trim_field(field: &[u8]) -> String {
    String::from_utf8_lossy(field)
        .trim_end_matches(|c| c == ' ' || c == '\0')
        .to_string()
}

/// Converts a duration to a whole number of one-second supervisor ticks
pub fn duration_to_ticks(duration: Duration) -> u32 {
    duration.as_secs().min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_padded() {
        let field: [u8; 8] = space_padded("F4ABC");
        assert_eq!(&field, b"F4ABC   ");

        let truncated: [u8; 4] = space_padded("TOOLONG");
        assert_eq!(&truncated, b"TOOL");
    }

    #[test]
    fn test_trim_field() {
        assert_eq!(trim_field(b"XRF001 \0"), "XRF001");
        assert_eq!(trim_field(b"        "), "");
    }

    #[test]
    fn test_duration_to_ticks() {
        assert_eq!(duration_to_ticks(Duration::from_millis(35_900)), 35);
        assert_eq!(duration_to_ticks(Duration::ZERO), 0);
    }
}
