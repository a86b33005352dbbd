//! Hash and HMAC values.
//!
//! On the wire a hash is the two-element array `[alg, bstr]`, using the FDO
//! hashtype registry numbers.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_repr::{Deserialize_repr, Serialize_repr};

/// FDO hashtype registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(i16)]
pub enum HashAlg {
    /// Plain SHA-256.
    Sha256 = -16,
    /// Plain SHA-384.
    Sha384 = -43,
    /// HMAC with SHA-256.
    HmacSha256 = 5,
    /// HMAC with SHA-384.
    HmacSha384 = 6,
}

impl HashAlg {
    /// Digest length in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlg::Sha256 | HashAlg::HmacSha256 => 32,
            HashAlg::Sha384 | HashAlg::HmacSha384 => 48,
        }
    }

    /// The plain-hash algorithm underlying this entry (identity for the
    /// non-HMAC variants).
    pub fn base_hash(&self) -> HashAlg {
        match self {
            HashAlg::Sha256 | HashAlg::HmacSha256 => HashAlg::Sha256,
            HashAlg::Sha384 | HashAlg::HmacSha384 => HashAlg::Sha384,
        }
    }

    /// The HMAC variant pairing with this entry's digest size.
    pub fn hmac_variant(&self) -> HashAlg {
        match self {
            HashAlg::Sha256 | HashAlg::HmacSha256 => HashAlg::HmacSha256,
            HashAlg::Sha384 | HashAlg::HmacSha384 => HashAlg::HmacSha384,
        }
    }
}

/// A hash or HMAC value: `[alg, bstr]` on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hash {
    /// Registry entry of the algorithm that produced `value`.
    pub alg: HashAlg,
    /// Digest bytes.
    pub value: ByteBuf,
}

impl Hash {
    /// Construct from an algorithm and digest bytes.
    pub fn new(alg: HashAlg, value: Vec<u8>) -> Self {
        Self {
            alg,
            value: ByteBuf::from(value),
        }
    }

    /// Digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.value
    }

    /// Constant-time equality against another digest of the same algorithm.
    pub fn matches(&self, other: &Hash) -> bool {
        if self.alg != other.alg || self.value.len() != other.value.len() {
            return false;
        }
        let mut diff = 0u8;
        for (a, b) in self.value.iter().zip(other.value.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_len() {
        assert_eq!(HashAlg::Sha256.digest_len(), 32);
        assert_eq!(HashAlg::Sha384.digest_len(), 48);
        assert_eq!(HashAlg::HmacSha256.digest_len(), 32);
        assert_eq!(HashAlg::HmacSha384.digest_len(), 48);
    }

    #[test]
    fn test_base_and_hmac_variant() {
        assert_eq!(HashAlg::HmacSha256.base_hash(), HashAlg::Sha256);
        assert_eq!(HashAlg::Sha384.hmac_variant(), HashAlg::HmacSha384);
    }

    #[test]
    fn test_matches_same_alg_only() {
        let a = Hash::new(HashAlg::Sha256, vec![1; 32]);
        let b = Hash::new(HashAlg::Sha256, vec![1; 32]);
        let c = Hash::new(HashAlg::Sha384, vec![1; 32]);
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }

    #[test]
    fn test_matches_detects_flip() {
        let a = Hash::new(HashAlg::Sha256, vec![1; 32]);
        let mut flipped = vec![1u8; 32];
        flipped[13] ^= 0x80;
        let b = Hash::new(HashAlg::Sha256, flipped);
        assert!(!a.matches(&b));
    }
}
