use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::errors::ChainResult;

/// Previous-hash placeholder carried by the genesis block.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode::<[u8; 32]>(hasher.finalize().into())
}

/// Serializes `value` as compact JSON. Field order follows the struct
/// declaration and floats use the shortest round-trip form, so the bytes are
/// reproducible across processes.
pub fn canonical_json<T: Serialize>(value: &T) -> ChainResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn hash_canonical<T: Serialize>(value: &T) -> ChainResult<String> {
    Ok(sha256_hex(&canonical_json(value)?))
}

/// Cheap proof token predicate: the hex digest starts with `difficulty` zeros.
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let required = difficulty as usize;
    hash.len() >= required && hash.bytes().take(required).all(|byte| byte == b'0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn difficulty_counts_leading_zeros() {
        assert!(meets_difficulty("00ab", 2));
        assert!(!meets_difficulty("0fab", 2));
        assert!(meets_difficulty("ffff", 0));
        assert!(!meets_difficulty("00", 3));
        assert_eq!(ZERO_HASH.len(), 64);
        assert!(meets_difficulty(ZERO_HASH, 64));
    }
}
