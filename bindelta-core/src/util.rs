//! Formatting and hashing helpers shared across the crate.

use sha2::{Digest, Sha256};

use crate::Address;

/// First eight bytes of the SHA-256 of `data`, big-endian.
///
/// All bucket keys derived from content (byte strings, names, multisets,
/// sequences) go through this so they are deterministic across runs
/// without a seeded hasher.
pub fn hash64(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// `hash64` over a word sequence, preserving order.
pub fn hash64_words(words: &[u64]) -> u64 {
    let mut bytes = Vec::with_capacity(words.len() * 8);
    for word in words {
        bytes.extend_from_slice(&word.to_be_bytes());
    }
    hash64(&bytes)
}

/// Formats an address as fixed-width upper-case hex.
///
/// Addresses that fit 32 bits use 8 digits, larger ones 16, so log and
/// groundtruth lines stay column-aligned for one binary.
pub fn format_address(address: Address) -> String {
    if address > u64::from(u32::MAX) {
        format!("{address:016X}")
    } else {
        format!("{address:08X}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_addresses_use_eight_digits() {
        assert_eq!(format_address(0x1000), "00001000");
        assert_eq!(format_address(0), "00000000");
    }

    #[test]
    fn large_addresses_use_sixteen_digits() {
        assert_eq!(format_address(0x1_0000_0000), "0000000100000000");
    }

    #[test]
    fn hash64_is_stable_and_order_sensitive() {
        assert_eq!(hash64(b"push"), hash64(b"push"));
        assert_ne!(hash64_words(&[1, 2]), hash64_words(&[2, 1]));
    }
}
