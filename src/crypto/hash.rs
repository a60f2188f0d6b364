//! SHA-256 based hashing primitives and the `Hash32` newtype.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use std::fmt;

pub const HASH_LEN: usize = 32;
pub const RIPEMD_LEN: usize = 20;

/// 32-byte hash in wire order (little-endian when interpreted as a number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash32(pub [u8; HASH_LEN]);

impl Hash32 {
    #[inline]
    pub fn zero() -> Self {
        Hash32([0u8; HASH_LEN])
    }

    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn into_bytes(self) -> [u8; HASH_LEN] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Big-endian (display) form, the order block explorers print.
    pub fn display_be(&self) -> String {
        let mut reversed = self.0;
        reversed.reverse();
        hex::encode(reversed)
    }
}

/// Hex in wire order for logs and test fixtures.
impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

pub fn sha256(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Double SHA-256, the protocol's workhorse hash.
pub fn dsha256(data: &[u8]) -> Hash32 {
    Hash32(sha256(&sha256(data)))
}

/// RIPEMD-160 over SHA-256, used for address hashing.
pub fn sharipe(data: &[u8]) -> [u8; RIPEMD_LEN] {
    let mut hasher = Ripemd160::new();
    hasher.update(sha256(data));
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use rstest::rstest;

    #[rstest]
    #[case(b"hello world", hex!("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"))]
    #[case(b"", hex!("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"))]
    fn test_sha256(#[case] input: &[u8], #[case] expected: [u8; 32]) {
        assert_eq!(sha256(input), expected);
    }

    #[test]
    fn test_sharipe_hello() {
        assert_eq!(
            sharipe(b"hello"),
            hex!("b6a9c8c230722b7c748331a8b450f05566dc7d0f")
        );
    }

    #[test]
    fn test_hash32_display() {
        let h = Hash32::from_bytes(hex!(
            "6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000"
        ));
        assert_eq!(
            h.to_string(),
            "6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000"
        );
        assert_eq!(
            h.display_be(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert!(!h.is_zero());
        assert!(Hash32::zero().is_zero());
    }
}
