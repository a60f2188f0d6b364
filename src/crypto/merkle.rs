//! Merkle root computation over transaction hashes.

use crate::crypto::hash::{dsha256, Hash32, HASH_LEN};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    EmptyTree,
}

impl fmt::Display for MerkleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MerkleError::EmptyTree => write!(f, "Cannot compute Merkle root of empty list"),
        }
    }
}

impl std::error::Error for MerkleError {}

/// Bottom-up binary fold: pair up, double-SHA-256 each pair, repeat until
/// one hash remains. An odd tail is paired with itself.
pub fn merkle_root(leaves: &[Hash32]) -> Result<Hash32, MerkleError> {
    if leaves.is_empty() {
        return Err(MerkleError::EmptyTree);
    }

    let mut level: Vec<Hash32> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for chunk in level.chunks(2) {
            let left = &chunk[0];
            let right = chunk.get(1).unwrap_or(left);
            let mut buffer = [0u8; HASH_LEN * 2];
            buffer[..HASH_LEN].copy_from_slice(left.as_bytes());
            buffer[HASH_LEN..].copy_from_slice(right.as_bytes());
            next.push(dsha256(&buffer));
        }
        level = next;
    }

    Ok(level[0])
}
