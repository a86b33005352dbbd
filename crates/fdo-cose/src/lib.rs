//! # fdo-cose
//!
//! COSE layer of the FDO server workspace, built on [`coset`]:
//!
//! - [`sign1`]: `COSE_Sign1` creation and verification. The signature is
//!   always computed and checked over the exact received bytes — the
//!   protected-header byte string and payload round-trip untouched.
//! - [`encrypt0`]: the TO2 encrypted tunnel. Authenticated-encryption
//!   suites produce a bare `COSE_Encrypt0`; encrypt-then-MAC suites wrap
//!   the `Encrypt0` in a companion `COSE_Mac0` keyed with the session
//!   verification key.
//! - [`keys`]: the signing-key enum and the decoding of the wire
//!   [`fdo_types::PublicKey`] union into concrete verifiers.
//!
//! Header maps use integer labels (1 = alg, 5 = IV). Messages carrying
//! unknown critical headers fail verification.

pub mod encrypt0;
pub mod keys;
pub mod sign1;

pub use keys::{x5chain_public_key, SignKey, VerifyKey};
pub use sign1::Sign1;

/// Error types for COSE operations.
#[derive(Debug, thiserror::Error)]
pub enum CoseError {
    /// Structure did not parse as the expected COSE message.
    #[error("malformed COSE structure: {0}")]
    Format(String),

    /// Signature, MAC, or decryption failure; no sub-reason is carried.
    #[error("COSE verification failed")]
    Verification,

    /// The message declared a critical header this implementation does
    /// not understand.
    #[error("unknown critical header")]
    UnknownCriticalHeader,

    /// A payload was expected but the message carried nil.
    #[error("missing payload")]
    MissingPayload,

    /// Key material problems (wrong type, undecodable body).
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Underlying cryptographic failure.
    #[error(transparent)]
    Crypto(#[from] fdo_crypto::CryptoError),

    /// Underlying codec failure.
    #[error(transparent)]
    Cbor(#[from] fdo_cbor::CborError),
}

pub type Result<T> = std::result::Result<T, CoseError>;

impl From<coset::CoseError> for CoseError {
    fn from(e: coset::CoseError) -> Self {
        CoseError::Format(e.to_string())
    }
}
