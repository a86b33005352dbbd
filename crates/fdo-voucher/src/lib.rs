//! # fdo-voucher
//!
//! The ownership-voucher data model and chain operations.
//!
//! A voucher is a cryptographically chained, transferable credential
//! rooted at the manufacturer: a header created during DI, an HMAC over
//! that header keyed by a device secret, the device certificate chain,
//! and a sequence of COSE_Sign1 entries each signed by the previous
//! owner and naming the next.
//!
//! Two invariants shape the implementation:
//!
//! 1. The encoded header and entries are carried as exact bytes
//!    ([`fdo_cbor::RawCbor`]); hashing and signature checks always run
//!    over the bytes received, never a re-encoding.
//! 2. Nothing reaches storage without passing [`OwnershipVoucher::validate_chain`];
//!    partial chains are never accepted.

pub mod pem;
pub mod voucher;

pub use voucher::{OvEntryPayload, OvHeader, OwnershipVoucher};

/// Chain-validation failure reasons. Used internally and in logs; the
/// protocol layer collapses them into a single wire error code.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChainError {
    /// The header's manufacturer key is not in the trusted set.
    #[error("manufacturer key is not trusted")]
    UntrustedManufacturer,

    /// An entry was not a decodable COSE_Sign1 with the expected payload.
    #[error("entry {0}: malformed")]
    MalformedEntry(usize),

    /// An entry's signature did not verify under the previous owner key.
    #[error("entry {0}: signature mismatch")]
    SignatureMismatch(usize),

    /// An entry's previous-entry hash did not match the computed chain
    /// hash.
    #[error("entry {0}: previous-entry hash mismatch")]
    EntryHashMismatch(usize),

    /// An entry's header-info hash did not match the header.
    #[error("entry {0}: header info hash mismatch")]
    HeaderInfoMismatch(usize),

    /// An entry used a hash algorithm other than the one the header
    /// declares.
    #[error("entry {0}: hash algorithm differs from header")]
    HashAlgMixed(usize),
}

/// Error types for voucher parsing and operations.
#[derive(Debug, thiserror::Error)]
pub enum VoucherError {
    /// Codec failure while parsing or encoding.
    #[error(transparent)]
    Cbor(#[from] fdo_cbor::CborError),

    /// COSE failure outside chain validation (extension signing).
    #[error(transparent)]
    Cose(#[from] fdo_cose::CoseError),

    /// Cryptographic failure (HMAC computation).
    #[error(transparent)]
    Crypto(#[from] fdo_crypto::CryptoError),

    /// Chain validation failed; the specific reason stays internal.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// The voucher declared an unsupported protocol version.
    #[error("unsupported protocol version {0}")]
    VersionMismatch(u16),

    /// PEM framing was invalid.
    #[error("invalid voucher PEM")]
    Pem,
}

pub type Result<T> = std::result::Result<T, VoucherError>;
