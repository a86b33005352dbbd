//! # fdo-store
//!
//! Persistence contracts for the protocol engine and two
//! implementations: an in-memory store for tests and single-process
//! servers, and a SQLite store (WAL, schema constant, migration runner)
//! for the real services.
//!
//! The contracts deal in opaque bytes: session state is the protocol
//! crate's CBOR, voucher rows are the exact bytes received or extended
//! (never re-serialized), rendezvous blobs are CBOR-encoded [`RvBlob`]s.
//! Time-sensitive operations take the caller's clock (`now`, Unix
//! seconds) so expiry is deterministic and testable.

pub mod memory;
pub mod migrations;
pub mod schema;
pub mod sqlite;

use fdo_types::Guid;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// Store error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// An opaque bearer token binding a protocol run to its session row.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(String);

impl Token {
    /// Generate a globally unique token: 16 random bytes, URL-safe
    /// base64.
    pub fn generate() -> Self {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;
        let mut bytes = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Adopt a token string received in an `Authorization` header.
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    /// The bearer string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An owner rendezvous blob as stored by the rendezvous service: the
/// owner-signed `To1d` bytes (returned to the device verbatim) plus the
/// device's attestation public key extracted from the voucher during
/// TO0, used to verify the device in TO1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RvBlob {
    /// Exact encoded `To1d` COSE_Sign1 bytes.
    pub to1d: ByteBuf,
    /// The device attestation public key (X5CHAIN body of the voucher's
    /// certificate chain).
    pub device_pk: fdo_types::PublicKey,
}

/// Per-token session state. One protocol run per token; state is
/// destroyed on completion, error, or expiry.
pub trait SessionStore: Send + Sync {
    /// Mint a fresh globally unique token.
    fn new_token(&self) -> Token {
        Token::generate()
    }

    /// Load session state. Fails with `NotFound` for unknown or expired
    /// tokens.
    fn get(&self, token: &Token, now: u64) -> Result<Vec<u8>>;

    /// Atomically replace session state and refresh its expiry.
    fn put(&self, token: &Token, state: Vec<u8>, now: u64) -> Result<()>;

    /// Delete session state. Idempotent.
    fn delete(&self, token: &Token) -> Result<()>;
}

/// Voucher rows: exact bytes keyed by GUID, mutations linearizable per
/// GUID.
pub trait VoucherStore: Send + Sync {
    /// Insert a validated voucher. Fails on duplicate GUID.
    fn insert(&self, guid: &Guid, voucher: &[u8]) -> Result<()>;

    /// Fetch a voucher's exact bytes.
    fn get(&self, guid: &Guid) -> Result<Vec<u8>>;

    /// Run `f` with an exclusive hold on the voucher row; the possibly
    /// mutated bytes are written back atomically.
    fn with_voucher(
        &self,
        guid: &Guid,
        f: &mut dyn FnMut(&mut Vec<u8>) -> Result<()>,
    ) -> Result<()>;

    /// Atomically replace a voucher row, possibly under a new GUID (TO2
    /// completion with a fresh replacement GUID).
    fn replace(&self, old_guid: &Guid, new_guid: &Guid, voucher: &[u8]) -> Result<()>;

    /// Remove a voucher row. Idempotent.
    fn remove(&self, guid: &Guid) -> Result<()>;
}

/// Rendezvous blobs: at most one per GUID, atomic replace, TTL-bounded.
pub trait RvBlobStore: Send + Sync {
    /// Store or replace the blob for a GUID with the given TTL.
    fn put_rv_blob(&self, guid: &Guid, blob: &RvBlob, wait_seconds: u32, now: u64) -> Result<()>;

    /// Fetch the blob if present and unexpired.
    fn get_rv_blob(&self, guid: &Guid, now: u64) -> Result<RvBlob>;
}

/// Devmod descriptors reported by devices during TO2, keyed by GUID.
/// The value is the serviceinfo crate's CBOR encoding.
pub trait DevmodStore: Send + Sync {
    /// Store or replace the devmod snapshot for a device.
    fn put_devmod(&self, guid: &Guid, devmod_cbor: &[u8]) -> Result<()>;

    /// Fetch a stored snapshot.
    fn get_devmod(&self, guid: &Guid) -> Result<Vec<u8>>;
}

/// Owner/manufacturer key rows: public key bytes plus an opaque
/// reference to the private half (a PKCS#8 blob or an HSM handle),
/// loaded once at process init.
pub trait OwnerKeyStore: Send + Sync {
    /// Store or replace a key row.
    fn put_key(&self, key_type: u8, pk_bytes: &[u8], priv_ref: &[u8]) -> Result<()>;

    /// Fetch `(pk_bytes, priv_ref)` for a key type.
    fn get_key(&self, key_type: u8) -> Result<(Vec<u8>, Vec<u8>)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique() {
        let a = Token::generate();
        let b = Token::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn test_token_roundtrip() {
        let token = Token::generate();
        let adopted = Token::from_string(token.as_str().to_string());
        assert_eq!(token, adopted);
    }

    #[test]
    fn test_rv_blob_serializes() {
        let blob = RvBlob {
            to1d: ByteBuf::from(vec![1, 2, 3]),
            device_pk: fdo_types::PublicKey::new(
                fdo_types::KeyType::SecP256,
                fdo_types::KeyEncoding::X509,
                vec![4, 5],
            ),
        };
        let bytes = fdo_cbor::to_vec(&blob).expect("serialize");
        let back: RvBlob = fdo_cbor::from_slice(&bytes).expect("deserialize");
        assert_eq!(back.to1d, blob.to1d);
        assert_eq!(back.device_pk, blob.device_pk);
    }
}
