//! Compact-target arithmetic: expansion to 256 bits, comparison against
//! header hashes, re-compaction, and the periodic retarget computation.

use crate::config::ChainParams;
use crate::crypto::Hash32;
use num_bigint::BigUint;
use num_traits::{One, Zero};

/// Highest allowed target (lowest difficulty), the genesis compact form.
pub const POW_LIMIT_COMPACT: u32 = 0x1D00_FFFF;

const MANTISSA_MASK: u32 = 0x007F_FFFF;

/// Expand the 32-bit compact form to the full 256-bit threshold:
/// `mantissa << (8 * (exponent - 3))`.
pub fn expand_compact(compact: u32) -> BigUint {
    let mantissa = BigUint::from(compact & MANTISSA_MASK);
    let exponent = compact >> 24;
    if exponent <= 3 {
        mantissa >> (8 * (3 - exponent) as usize)
    } else {
        mantissa << (8 * (exponent - 3) as usize)
    }
}

/// Re-compact an expanded target. The 0x00800000 mantissa bit is a sign
/// marker in the encoding and must stay clear.
pub fn compress_target(target: &BigUint) -> u32 {
    if target.is_zero() {
        return 0;
    }

    let bytes = target.to_bytes_be();
    let mut size = bytes.len() as u32;
    let mut mantissa: u32 = 0;
    for &byte in bytes.iter().take(3) {
        mantissa = (mantissa << 8) | byte as u32;
    }
    if size < 3 {
        mantissa <<= 8 * (3 - size);
    }
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        size += 1;
    }
    (size << 24) | mantissa
}

/// A header hash (interpreted little-endian) satisfies a target iff it is
/// numerically ≤ the target.
pub fn hash_satisfies_target(hash: &Hash32, target: &BigUint) -> bool {
    BigUint::from_bytes_le(hash.as_bytes()) <= *target
}

pub fn hash_satisfies_target_compact(hash: &Hash32, compact: u32) -> bool {
    hash_satisfies_target(hash, &expand_compact(compact))
}

/// Expected work of one block at the given target: 2^256 / (target + 1).
pub fn block_work(compact: u32) -> BigUint {
    let target = expand_compact(compact);
    (BigUint::one() << 256u32) / (target + BigUint::one())
}

/// Next compact target after a retarget period: previous target scaled by
/// the actual timespan over the desired one, the ratio clamped to
/// [1/retarget_bound, retarget_bound], never easier than the PoW limit.
pub fn next_compact_target(
    prev_compact: u32,
    actual_timespan: u32,
    params: &ChainParams,
) -> u32 {
    let desired = params.desired_retarget_period;
    let clamped = actual_timespan.clamp(desired / params.retarget_bound, desired * params.retarget_bound);

    let next = expand_compact(prev_compact) * BigUint::from(clamped) / BigUint::from(desired);
    let limit = expand_compact(POW_LIMIT_COMPACT);
    compress_target(&next.min(limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChainParams, NetworkType};
    use hex_literal::hex;

    fn hash_of(value: &BigUint) -> Hash32 {
        let mut bytes = [0u8; 32];
        let le = value.to_bytes_le();
        bytes[..le.len()].copy_from_slice(&le);
        Hash32::from_bytes(bytes)
    }

    #[test]
    fn test_expand_genesis_target() {
        // 0x1d00ffff = 0x00ffff << (8 * 0x1a)
        let expected = BigUint::from(0x00FF_FFu32) << (8 * 0x1A);
        assert_eq!(expand_compact(POW_LIMIT_COMPACT), expected);
    }

    #[test]
    fn test_boundary_satisfies_and_plus_one_fails() {
        for compact in [POW_LIMIT_COMPACT, 0x1800_9645u32, 0x1B04_04CBu32] {
            let target = expand_compact(compact);
            assert!(hash_satisfies_target_compact(&hash_of(&target), compact));
            let above = &target + BigUint::one();
            assert!(!hash_satisfies_target_compact(&hash_of(&above), compact));
        }
    }

    #[test]
    fn test_genesis_hash_satisfies_genesis_target() {
        let genesis = Hash32::from_bytes(hex!(
            "6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000"
        ));
        assert!(hash_satisfies_target_compact(&genesis, POW_LIMIT_COMPACT));
    }

    #[test]
    fn test_compact_roundtrip() {
        for compact in [POW_LIMIT_COMPACT, 0x1B04_04CBu32, 0x1800_9645u32, 0x0300_FFFFu32] {
            assert_eq!(compress_target(&expand_compact(compact)), compact);
        }
    }

    #[test]
    fn test_block_work_grows_with_difficulty() {
        // A smaller target (harder block) represents more work.
        assert!(block_work(0x1B04_04CB) > block_work(POW_LIMIT_COMPACT));
        assert_eq!(block_work(POW_LIMIT_COMPACT), block_work(POW_LIMIT_COMPACT));
    }

    #[test]
    fn test_retarget_clamped() {
        let params = ChainParams::for_network(NetworkType::Mainnet);
        let desired = params.desired_retarget_period;

        // On-schedule period keeps the target unchanged.
        assert_eq!(
            next_compact_target(0x1B04_04CB, desired, &params),
            0x1B04_04CB
        );

        // Absurdly fast blocks tighten by at most retarget_bound (×4 here):
        // 0x0404cb / 4 re-compacted is 0x010132 at the same exponent.
        let fast = next_compact_target(0x1B04_04CB, 1, &params);
        assert_eq!(fast, 0x1B01_0132);

        // Slow blocks never ease past the PoW limit.
        let slow = next_compact_target(POW_LIMIT_COMPACT, desired * 100, &params);
        assert_eq!(slow, POW_LIMIT_COMPACT);
    }
}
