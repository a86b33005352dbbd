//! # fdo-crypto
//!
//! Cryptographic layer of the FDO server workspace:
//!
//! - **Hashing/HMAC** helpers producing the wire [`fdo_types::Hash`] type
//!   via [`hash`]
//! - **Key-exchange suites** (ECDH P-256/P-384, ASYMKEX; DHKEX declared
//!   but refused) via [`kex`]
//! - **Session-key derivation** (HKDF over the shared secret and both
//!   exchanged randoms) via [`kdf`]
//! - **Cipher-suite registry** (AES-GCM, AES-CTR/CBC + HMAC; CCM declared
//!   but refused) with per-suite IV policy via [`cipher`]
//! - **Device certificate issuance** from a CSR via [`cert`]
//!
//! The suite registries are closed enums with exhaustive matches: the FDO
//! registries fix the algorithm set, so a new entry is a deliberate
//! protocol change, not a runtime registration.

pub mod cert;
pub mod cipher;
pub mod hash;
pub mod kdf;
pub mod kex;

/// Error types for cryptographic operations.
///
/// Verification and decryption failures deliberately carry no detail
/// beyond the variant: the protocol layer collapses them all into one
/// wire error code.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// A signature, MAC, or AEAD tag did not verify, or a ciphertext did
    /// not decrypt.
    #[error("verification failed")]
    Verification,

    /// A named suite is in the registry but not implemented; it must be
    /// refused at negotiation time.
    #[error("unsupported suite: {0}")]
    UnsupportedSuite(&'static str),

    /// Key material was malformed or of the wrong type for the operation.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// A key-exchange message could not be parsed.
    #[error("malformed key-exchange message")]
    MalformedKexMessage,

    /// The AES-CTR counter would roll over within the session.
    #[error("cipher IV counter exhausted")]
    IvCounterExhausted,

    /// Certificate generation or parsing failed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Key derivation failed.
    #[error("key derivation failed")]
    Kdf,
}

pub type Result<T> = std::result::Result<T, CryptoError>;
