//! Double-SHA256 hashing and 256-bit integer difficulty arithmetic.
//!
//! Network-difficulty comparisons must stay integer-exact; floating point is
//! only acceptable for human-readable difficulty reporting.

use bitcoin::hashes::{sha256d, Hash as _};
use once_cell::sync::Lazy;
use uint::construct_uint;

construct_uint! {
    /// Unsigned 256-bit integer, used for target/difficulty comparisons.
    pub struct U256(4);
}

/// `pdiff`: the pool-difficulty-1 target, expressed as an integer.
pub static DIFF1: Lazy<U256> = Lazy::new(|| {
    U256::from_dec_str("26959535291011309493156476344723991336010898738574164086137773096960")
        .expect("DIFF1 constant is a valid decimal integer")
});

/// `SHA256(SHA256(data))`.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    sha256d::Hash::hash(data).to_byte_array()
}

/// Reads a 32-byte hash as an unsigned 256-bit integer, little-endian.
pub fn le256(hash: &[u8; 32]) -> U256 {
    U256::from_little_endian(hash)
}

/// Integer-exact block-found check (§4.1/§9): does `hash`, read
/// little-endian, clear the target implied by `nbits`? Never goes through
/// `f64` — `difficulty_from_hash`/`network_difficulty` below lose precision
/// beyond ~53 bits of a 256-bit value and must not be used to decide
/// whether a share is a block.
pub fn hash_meets_target(hash: &[u8; 32], nbits: u32) -> bool {
    le256(hash) <= compact_target_to_u256(nbits)
}

/// Converts a `U256` into an `f64`, losing precision beyond ~53 significant
/// bits. Only used for reporting — comparisons against network difficulty
/// must stay in `U256`.
pub fn u256_to_f64(v: U256) -> f64 {
    let mut acc = 0f64;
    for limb in v.0.iter().rev() {
        acc = acc * 18_446_744_073_709_551_616.0 + (*limb as f64);
    }
    acc
}

/// `DIFF1 / le256(hash)` as a reportable `f64`. Session-difficulty
/// comparisons tolerate the precision loss (§8 P1's `rel <= 1e-9`
/// tolerance); the network-difficulty block-found decision must use
/// [`hash_meets_target`] instead.
pub fn difficulty_from_hash(hash: &[u8; 32]) -> f64 {
    let target = le256(hash);
    if target.is_zero() {
        return f64::INFINITY;
    }
    u256_to_f64(*DIFF1) / u256_to_f64(target)
}

/// Decodes a Bitcoin "compact" `nBits` target encoding into a 256-bit integer.
///
/// First byte is the exponent, remaining three bytes are the mantissa
/// (sign bit in the mantissa's top bit is ignored — negative targets never
/// occur in valid headers).
pub fn compact_target_to_u256(nbits: u32) -> U256 {
    let exponent = (nbits >> 24) as i64;
    let mantissa = U256::from(nbits & 0x007f_ffff);
    if exponent <= 3 {
        mantissa >> (8 * (3 - exponent)) as usize
    } else {
        mantissa << (8 * (exponent - 3)) as usize
    }
}

/// Network difficulty implied by a compact target, as a reportable `f64`
/// (reporting only — see [`hash_meets_target`] for the block-found check).
pub fn network_difficulty(nbits: u32) -> f64 {
    let target = compact_target_to_u256(nbits);
    if target.is_zero() {
        return f64::INFINITY;
    }
    u256_to_f64(*DIFF1) / u256_to_f64(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_known_vector() {
        // SHA256d("") per Bitcoin Core test vectors.
        let h = sha256d(b"");
        assert_eq!(
            hex::encode(h),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c944"
        );
    }

    #[test]
    fn compact_target_bitcoin_genesis() {
        // Bitcoin's initial difficulty-1 target.
        let target = compact_target_to_u256(0x1d00ffff);
        let mut bytes = [0u8; 32];
        target.to_little_endian(&mut bytes);
        assert_eq!(bytes[26], 0xff);
        assert_eq!(bytes[27], 0xff);
        assert_eq!(bytes[28], 0x00);
        for b in &bytes[29..] {
            assert_eq!(*b, 0);
        }
    }

    #[test]
    fn compact_target_strictly_decreases_with_difficulty() {
        // P3: higher network difficulty means a smaller compact target.
        let easy = compact_target_to_u256(0x1d00ffff);
        let hard = compact_target_to_u256(0x1c00ffff);
        assert!(hard < easy);
        assert!(network_difficulty(0x1c00ffff) > network_difficulty(0x1d00ffff));
    }

    #[test]
    fn difficulty_monotone_non_increasing_in_hash() {
        // P3: difficulty_from_hash is monotone non-increasing in le256(hash).
        let small = {
            let mut h = [0u8; 32];
            h[0] = 1;
            h
        };
        let large = {
            let mut h = [0u8; 32];
            h[31] = 1;
            h
        };
        assert!(difficulty_from_hash(&small) >= difficulty_from_hash(&large));
    }

    #[test]
    fn hash_meets_target_is_integer_exact_at_the_boundary() {
        // A hash exactly equal to the target clears it; one unit above does
        // not. Picked to sit right at the boundary where f64's ~53 bits of
        // precision against a 256-bit value would misclassify it.
        let nbits = 0x1d00ffff;
        let target = compact_target_to_u256(nbits);

        let mut at_target = [0u8; 32];
        target.to_little_endian(&mut at_target);
        assert!(hash_meets_target(&at_target, nbits));

        let above_target = le256(&at_target) + U256::one();
        let mut bytes = [0u8; 32];
        above_target.to_little_endian(&mut bytes);
        assert!(!hash_meets_target(&bytes, nbits));
    }

    #[test]
    fn diff1_matches_contract_constant() {
        assert_eq!(
            DIFF1.to_string(),
            "26959535291011309493156476344723991336010898738574164086137773096960"
        );
    }
}
