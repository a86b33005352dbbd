//! SHA-2 and HMAC helpers producing the wire [`Hash`] type.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384};

use fdo_types::{Hash, HashAlg};

use crate::{CryptoError, Result};

/// Digest `data` with the given (non-HMAC) algorithm.
pub fn hash(alg: HashAlg, data: &[u8]) -> Hash {
    match alg.base_hash() {
        HashAlg::Sha256 => Hash::new(HashAlg::Sha256, Sha256::digest(data).to_vec()),
        _ => Hash::new(HashAlg::Sha384, Sha384::digest(data).to_vec()),
    }
}

/// Digest the concatenation of several segments without building an
/// intermediate buffer.
pub fn hash_parts(alg: HashAlg, parts: &[&[u8]]) -> Hash {
    match alg.base_hash() {
        HashAlg::Sha256 => {
            let mut h = Sha256::new();
            for part in parts {
                h.update(part);
            }
            Hash::new(HashAlg::Sha256, h.finalize().to_vec())
        }
        _ => {
            let mut h = Sha384::new();
            for part in parts {
                h.update(part);
            }
            Hash::new(HashAlg::Sha384, h.finalize().to_vec())
        }
    }
}

/// Compute an HMAC over `data`, returning the wire HMAC variant matching
/// `alg`'s digest size.
pub fn hmac(alg: HashAlg, key: &[u8], data: &[u8]) -> Result<Hash> {
    match alg.hmac_variant() {
        HashAlg::HmacSha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            mac.update(data);
            Ok(Hash::new(HashAlg::HmacSha256, mac.finalize().into_bytes().to_vec()))
        }
        _ => {
            let mut mac = Hmac::<Sha384>::new_from_slice(key)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            mac.update(data);
            Ok(Hash::new(HashAlg::HmacSha384, mac.finalize().into_bytes().to_vec()))
        }
    }
}

/// Verify an HMAC in constant time.
pub fn verify_hmac(key: &[u8], data: &[u8], expected: &Hash) -> Result<()> {
    match expected.alg {
        HashAlg::HmacSha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            mac.update(data);
            mac.verify_slice(expected.as_bytes()).map_err(|_| CryptoError::Verification)
        }
        HashAlg::HmacSha384 => {
            let mut mac = Hmac::<Sha384>::new_from_slice(key)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            mac.update(data);
            mac.verify_slice(expected.as_bytes()).map_err(|_| CryptoError::Verification)
        }
        _ => Err(CryptoError::Verification),
    }
}

/// Raw HMAC-SHA256 bytes (no wire wrapper), used by the MAC side of the
/// encrypt-then-MAC cipher suites.
pub fn hmac_sha256_raw(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Raw HMAC-SHA384 bytes (no wire wrapper).
pub fn hmac_sha384_raw(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        Hmac::<Sha384>::new_from_slice(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Constant-time verification of a raw HMAC produced by
/// [`hmac_sha256_raw`] or [`hmac_sha384_raw`].
pub fn verify_hmac_raw(alg: HashAlg, key: &[u8], data: &[u8], tag: &[u8]) -> Result<()> {
    match alg.hmac_variant() {
        HashAlg::HmacSha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            mac.update(data);
            mac.verify_slice(tag).map_err(|_| CryptoError::Verification)
        }
        _ => {
            let mut mac = Hmac::<Sha384>::new_from_slice(key)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            mac.update(data);
            mac.verify_slice(tag).map_err(|_| CryptoError::Verification)
        }
    }
}
