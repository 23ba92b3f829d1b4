//! CRC-32 helpers.
//!
//! The bootloader checks every block and the sealed image with the standard
//! reflected CRC-32 (polynomial `0xEDB88320`, initial value and final XOR
//! `0xFFFFFFFF`). Chaining is done on finalized values, so
//! `crc32_update(crc32(a), b) == crc32(a ++ b)`.

use crc32fast::Hasher;

/// CRC-32 of a single buffer.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Continue a CRC-32 computed over earlier data with more bytes.
///
/// Passing `0` as `crc` starts a fresh checksum.
pub fn crc32_update(crc: u32, data: &[u8]) -> u32 {
    let mut hasher = Hasher::new_with_initial(crc);
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_crc32_empty() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_crc32_update_from_zero_matches_crc32() {
        let data = [0xA5u8; 300];
        assert_eq!(crc32_update(0, &data), crc32(&data));
    }

    #[test]
    fn test_crc32_update_chains() {
        let first = vec![0x11u8; 1024];
        let second = vec![0x22u8; 1024];
        let mut joined = first.clone();
        joined.extend_from_slice(&second);

        let chained = crc32_update(crc32_update(0, &first), &second);
        assert_eq!(chained, crc32(&joined));
    }
}
