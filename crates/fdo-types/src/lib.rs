//! # fdo-types
//!
//! Shared domain types for the FDO (FIDO Device Onboard) server workspace:
//! device GUIDs, protocol nonces, hash values, the tagged public-key union,
//! rendezvous directives, owner redirect addresses, and the protocol error
//! code registry.
//!
//! Everything here is plain data. Cryptographic interpretation of these
//! types (signature verification, chain validation, key exchange) lives in
//! the `fdo-cose`, `fdo-crypto`, and `fdo-voucher` crates.

pub mod errcode;
pub mod guid;
pub mod hash;
pub mod pubkey;
pub mod rendezvous;

pub use errcode::ErrorCode;
pub use guid::{Guid, Nonce};
pub use hash::{Hash, HashAlg};
pub use pubkey::{KeyEncoding, KeyType, PublicKey};
pub use rendezvous::{RendezvousDirective, RendezvousInfo, RendezvousInstr, RvProtocol, RvTo2Addr, RvVar};

/// FDO protocol version carried in every message URL and voucher header
/// (101 = FDO 1.1).
pub const PROTOCOL_VERSION: u16 = 101;

/// Message type of the error message, shared by all protocols.
pub const MSG_ERROR: u8 = 255;

/// Device certificate chain: ordered DER certificates, leaf first.
/// The leaf certifies the device attestation key; the last entry is the
/// manufacturer CA.
pub type DeviceCertChain = Vec<serde_bytes::ByteBuf>;

/// Error types for domain-type parsing and conversion.
#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    /// A byte string had the wrong length for the target type.
    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    /// An integer did not name a known registry entry.
    #[error("unknown {registry} registry value: {value}")]
    UnknownRegistryValue { registry: &'static str, value: i64 },
}

pub type Result<T> = std::result::Result<T, TypeError>;
