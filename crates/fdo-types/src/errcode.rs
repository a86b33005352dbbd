//! Protocol error code registry, carried in the wire `ErrorMsg` (type 255).

use serde_repr::{Deserialize_repr, Serialize_repr};

/// Error codes surfaced to the peer. Internal failure detail (chain reason
/// codes, padding/MAC distinctions) is collapsed before reaching the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u16)]
pub enum ErrorCode {
    /// Out-of-order or semantically invalid message; terminal.
    InvalidMessage = 1,
    /// Unknown GUID, missing or expired rendezvous blob.
    ResourceNotFound = 2,
    /// Signature, MAC, or decryption failure. Deliberately carries no
    /// sub-reason.
    Crypto = 3,
    /// Malformed CBOR body or size-limit violation.
    MessageBody = 4,
    /// Unknown or expired bearer token.
    InvalidToken = 5,
    /// Anything else; logged with a correlation id.
    Internal = 500,
}

impl ErrorCode {
    /// Short stable name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "invalid_message",
            ErrorCode::ResourceNotFound => "resource_not_found",
            ErrorCode::Crypto => "crypto_error",
            ErrorCode::MessageBody => "message_body_error",
            ErrorCode::InvalidToken => "invalid_token",
            ErrorCode::Internal => "internal_server_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_values() {
        assert_eq!(ErrorCode::InvalidMessage as u16, 1);
        assert_eq!(ErrorCode::ResourceNotFound as u16, 2);
        assert_eq!(ErrorCode::Crypto as u16, 3);
        assert_eq!(ErrorCode::MessageBody as u16, 4);
        assert_eq!(ErrorCode::Internal as u16, 500);
    }

    #[test]
    fn test_names_are_stable() {
        assert_eq!(ErrorCode::Crypto.name(), "crypto_error");
    }
}
