//! Masternode scoring.
//!
//! A score is the double-SHA256 of `(collateral ‖ block hash ‖ modifier)`
//! read as a big-endian 256-bit integer. Rank comparisons go through the
//! compact (difficulty-style) projection of that integer: the precision loss
//! is part of the wire protocol and must not be widened.

use merged_consensus::Hash256;
use merged_primitives::encoding::{Encodable, Encoder};
use merged_primitives::hash::sha256d;
use merged_primitives::OutPoint;
use primitive_types::U256;

pub fn score_hash(collateral: &OutPoint, block_hash: &Hash256, modifier: u32) -> Hash256 {
    let mut encoder = Encoder::new();
    collateral.consensus_encode(&mut encoder);
    encoder.write_hash_le(block_hash);
    encoder.write_u32_le(modifier);
    sha256d(&encoder.into_inner())
}

pub fn score(collateral: &OutPoint, block_hash: &Hash256, modifier: u32) -> U256 {
    U256::from_big_endian(&score_hash(collateral, block_hash, modifier))
}

/// The compact form of a 256-bit integer, sign bit suppressed.
pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = ((value.bits() + 7) / 8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

/// The compact projection of a masternode score, as ranks compare it.
pub fn compact_score(collateral: &OutPoint, block_hash: &Hash256, modifier: u32) -> i64 {
    u256_to_compact(score(collateral, block_hash, modifier)) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_matches_difficulty_vectors() {
        assert_eq!(u256_to_compact(U256::zero()), 0);
        assert_eq!(u256_to_compact(U256::from(0x12u64)), 0x0112_0000);
        assert_eq!(u256_to_compact(U256::from(0x8000u64)), 0x0280_0000);
        // 0x1d00ffff is the classic maximum-target encoding.
        let target = U256::from(0xffffu64) << (8 * (0x1d - 3));
        assert_eq!(u256_to_compact(target), 0x1d00_ffff);
    }

    #[test]
    fn compact_never_sets_sign_bit() {
        let value = U256::from(0x00ff_ffffu64);
        let compact = u256_to_compact(value);
        assert_eq!(compact & 0x0080_0000, 0);
    }

    #[test]
    fn score_is_deterministic_and_input_sensitive() {
        let collateral = OutPoint::new([0x11; 32], 0);
        let block_hash = [0x22; 32];
        let first = score(&collateral, &block_hash, 1);
        assert_eq!(first, score(&collateral, &block_hash, 1));
        assert_ne!(first, score(&collateral, &block_hash, 2));
        assert_ne!(first, score(&OutPoint::new([0x11; 32], 1), &block_hash, 1));
        assert_ne!(first, score(&collateral, &[0x23; 32], 1));
    }

    #[test]
    fn score_reads_hash_big_endian() {
        let collateral = OutPoint::new([0x33; 32], 2);
        let block_hash = [0x44; 32];
        let hash = score_hash(&collateral, &block_hash, 1);
        assert_eq!(score(&collateral, &block_hash, 1), U256::from_big_endian(&hash));
    }
}
