//! Hashing primitives shared by the codec, validator, and stores.

pub mod hash;
pub mod merkle;

pub use hash::{dsha256, sha256, sharipe, Hash32, HASH_LEN, RIPEMD_LEN};
pub use merkle::{merkle_root, MerkleError};
