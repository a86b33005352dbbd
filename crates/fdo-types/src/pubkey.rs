//! The tagged public-key union: `[key_type, encoding, bstr]` on the wire.
//!
//! The body is kept as received. Equality is by canonical encoding, i.e. by
//! comparing the three fields directly; two keys that differ only in
//! encoding are distinct FDO public keys even when they wrap the same
//! cryptographic key.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_repr::{Deserialize_repr, Serialize_repr};

/// FDO public-key type registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum KeyType {
    /// RSA 2048 with restricted key/exponent choices (legacy manufacturing).
    Rsa2048Restr = 1,
    /// RSA with PKCS#1 v1.5 signatures.
    RsaPkcs = 5,
    /// RSA with PSS signatures.
    RsaPss = 6,
    /// ECDSA over NIST P-256.
    SecP256 = 10,
    /// ECDSA over NIST P-384.
    SecP384 = 11,
}

/// FDO public-key encoding registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum KeyEncoding {
    /// Crypto-library-specific encoding (modulus/exponent for RSA).
    Crypto = 0,
    /// X.509 SubjectPublicKeyInfo, DER.
    X509 = 1,
    /// An X5CHAIN: CBOR array of DER certificates, leaf first.
    X5Chain = 2,
    /// COSE_Key map.
    CoseKey = 3,
}

/// A public key as carried in voucher entries and protocol messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    /// Key type registry entry.
    pub key_type: KeyType,
    /// Body encoding registry entry.
    pub enc: KeyEncoding,
    /// Encoded key body, kept exactly as received.
    pub body: ByteBuf,
}

impl PublicKey {
    /// Construct from the three registry fields.
    pub fn new(key_type: KeyType, enc: KeyEncoding, body: Vec<u8>) -> Self {
        Self {
            key_type,
            enc,
            body: ByteBuf::from(body),
        }
    }

    /// Whether this is one of the RSA key types.
    pub fn is_rsa(&self) -> bool {
        matches!(self.key_type, KeyType::Rsa2048Restr | KeyType::RsaPkcs | KeyType::RsaPss)
    }

    /// Whether this is one of the EC key types.
    pub fn is_ec(&self) -> bool {
        matches!(self.key_type, KeyType::SecP256 | KeyType::SecP384)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_structural() {
        let a = PublicKey::new(KeyType::SecP256, KeyEncoding::X509, vec![1, 2, 3]);
        let b = PublicKey::new(KeyType::SecP256, KeyEncoding::X509, vec![1, 2, 3]);
        let c = PublicKey::new(KeyType::SecP256, KeyEncoding::CoseKey, vec![1, 2, 3]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_type_predicates() {
        let rsa = PublicKey::new(KeyType::RsaPss, KeyEncoding::X509, vec![]);
        let ec = PublicKey::new(KeyType::SecP384, KeyEncoding::X509, vec![]);
        assert!(rsa.is_rsa());
        assert!(!rsa.is_ec());
        assert!(ec.is_ec());
    }
}
