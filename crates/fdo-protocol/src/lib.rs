//! # fdo-protocol
//!
//! The four FDO protocol responders and their transport dispatch:
//!
//! - **DI** (Device Initialization, messages 10–13) on the
//!   manufacturing service
//! - **TO0** (owner publishes its rendezvous blob, 20–23) and **TO1**
//!   (device resolves its owner, 30–33) on the rendezvous service
//! - **TO2** (owner onboards the device, 60–71) on the owner service
//!
//! Responders are stateless across requests: every piece of mutable
//! state lives in the session store under the bearer token, serialized
//! as CBOR. The dispatcher routes `(msg_type, body, token)` to the
//! right responder, persists or destroys the session, and converts
//! every failure into the wire `ErrorMsg` with the session torn down.

pub mod context;
pub mod dispatch;
pub mod messages;
pub mod session;

mod di;
mod to0;
mod to1;
mod to2;

pub use context::{DiConfig, KeyRing, ServerContext, Service, To0Config, To2Config};
pub use dispatch::{dispatch, Request, Response};
pub use session::{Phase, Session};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use fdo_types::ErrorCode;

/// Error types for protocol processing. Every variant maps onto exactly
/// one wire error code; crypto failures deliberately carry no
/// sub-reason.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Out-of-order or semantically invalid message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Unknown GUID, missing or expired rendezvous blob.
    #[error("resource not found: {0}")]
    ResourceNotFound(&'static str),

    /// Signature, MAC, or decryption failure.
    #[error("cryptographic verification failed")]
    Crypto,

    /// Malformed body, size violation, or unsupported suite offer.
    #[error("message body error: {0}")]
    MessageBody(String),

    /// Unknown or expired bearer token.
    #[error("invalid token")]
    InvalidToken,

    /// Everything else; logged with a correlation id.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// The wire error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            ProtocolError::ResourceNotFound(_) => ErrorCode::ResourceNotFound,
            ProtocolError::Crypto => ErrorCode::Crypto,
            ProtocolError::MessageBody(_) => ErrorCode::MessageBody,
            ProtocolError::InvalidToken => ErrorCode::InvalidToken,
            ProtocolError::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<fdo_cbor::CborError> for ProtocolError {
    fn from(e: fdo_cbor::CborError) -> Self {
        ProtocolError::MessageBody(e.to_string())
    }
}

impl From<fdo_cose::CoseError> for ProtocolError {
    fn from(e: fdo_cose::CoseError) -> Self {
        match e {
            fdo_cose::CoseError::Format(msg) => ProtocolError::MessageBody(msg),
            fdo_cose::CoseError::Cbor(e) => ProtocolError::MessageBody(e.to_string()),
            // Verification, MAC, decryption, key problems: one code, no
            // sub-reason.
            _ => ProtocolError::Crypto,
        }
    }
}

impl From<fdo_crypto::CryptoError> for ProtocolError {
    fn from(e: fdo_crypto::CryptoError) -> Self {
        match e {
            fdo_crypto::CryptoError::UnsupportedSuite(name) => {
                ProtocolError::MessageBody(format!("unsupported suite {name}"))
            }
            fdo_crypto::CryptoError::MalformedKexMessage => {
                ProtocolError::MessageBody("malformed key-exchange message".into())
            }
            fdo_crypto::CryptoError::Certificate(msg) => ProtocolError::MessageBody(msg),
            _ => ProtocolError::Crypto,
        }
    }
}

impl From<fdo_voucher::VoucherError> for ProtocolError {
    fn from(e: fdo_voucher::VoucherError) -> Self {
        match e {
            // Chain reason codes stay internal; externally this is an
            // invalid message.
            fdo_voucher::VoucherError::Chain(reason) => {
                ProtocolError::InvalidMessage(format!("voucher rejected: {reason}"))
            }
            fdo_voucher::VoucherError::Cbor(e) => ProtocolError::MessageBody(e.to_string()),
            fdo_voucher::VoucherError::VersionMismatch(v) => {
                ProtocolError::MessageBody(format!("unsupported voucher version {v}"))
            }
            fdo_voucher::VoucherError::Pem => ProtocolError::MessageBody("invalid voucher PEM".into()),
            _ => ProtocolError::Crypto,
        }
    }
}

impl From<fdo_store::StoreError> for ProtocolError {
    fn from(e: fdo_store::StoreError) -> Self {
        match e {
            fdo_store::StoreError::NotFound("session") => ProtocolError::InvalidToken,
            fdo_store::StoreError::NotFound(what) => ProtocolError::ResourceNotFound(what),
            other => ProtocolError::Internal(other.to_string()),
        }
    }
}

impl From<fdo_serviceinfo::ServiceInfoError> for ProtocolError {
    fn from(e: fdo_serviceinfo::ServiceInfoError) -> Self {
        match e {
            fdo_serviceinfo::ServiceInfoError::SizeTooSmall => {
                ProtocolError::MessageBody("negotiated MTU too small".into())
            }
            fdo_serviceinfo::ServiceInfoError::Cbor(e) => ProtocolError::MessageBody(e.to_string()),
            other => ProtocolError::InvalidMessage(other.to_string()),
        }
    }
}

/// Cancellation signal plus optional wall-clock deadline, checked at
/// every suspension point. Tripping it deletes the session and releases
/// any held voucher row.
#[derive(Clone)]
pub struct Cancel {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cancel {
    /// A signal that never fires on its own.
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    /// A signal that additionally trips at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// Trip the signal.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether the signal has tripped or the deadline passed.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

impl Default for Cancel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ProtocolError::Crypto.code(), ErrorCode::Crypto);
        assert_eq!(ProtocolError::InvalidToken.code(), ErrorCode::InvalidToken);
        assert_eq!(
            ProtocolError::Internal("x".into()).code(),
            ErrorCode::Internal
        );
    }

    #[test]
    fn test_cose_verification_collapses_to_crypto() {
        let err: ProtocolError = fdo_cose::CoseError::Verification.into();
        assert_eq!(err.code(), ErrorCode::Crypto);
        let err: ProtocolError = fdo_cose::CoseError::UnknownCriticalHeader.into();
        assert_eq!(err.code(), ErrorCode::Crypto);
    }

    #[test]
    fn test_unknown_session_is_invalid_token() {
        let err: ProtocolError = fdo_store::StoreError::NotFound("session").into();
        assert_eq!(err.code(), ErrorCode::InvalidToken);
        let err: ProtocolError = fdo_store::StoreError::NotFound("voucher").into();
        assert_eq!(err.code(), ErrorCode::ResourceNotFound);
    }

    #[test]
    fn test_cancel() {
        let cancel = Cancel::new();
        assert!(!cancel.is_cancelled());
        cancel.cancel();
        assert!(cancel.is_cancelled());

        let expired = Cancel::with_deadline(Instant::now());
        assert!(expired.is_cancelled());
    }
}
