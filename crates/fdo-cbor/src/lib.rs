//! # fdo-cbor
//!
//! CBOR codec for the FDO wire protocol, built on [`ciborium`]'s value
//! model with two FDO-specific behaviors layered on top:
//!
//! - **Struct-as-array convention.** Every FDO message and substructure is
//!   a definite-length CBOR array, never a map. The [`ser`]/[`de`] modules
//!   provide a serde serializer/deserializer pair that encodes named
//!   structs positionally, so wire types stay ordinary `#[derive]` structs.
//! - **Deterministic encoding.** [`canonical`] re-encodes a
//!   [`ciborium::value::Value`] tree with minimal-length heads and, in
//!   canonical mode, RFC 8949 map-key ordering with duplicate rejection.
//!   Signed and MACed payloads must go through canonical mode.
//!
//! Exact encoded forms are preserved across verification by carrying
//! substructures byte-string-wrapped ("bstr .cbor"): see [`raw::RawCbor`]
//! and [`raw::TaggedBytes`]. Bytes received are the bytes hashed — opaque
//! values are never re-serialized.

pub mod canonical;
pub mod de;
pub mod raw;
pub mod ser;

pub use raw::{CborBstr, RawCbor, TaggedBytes};

use ciborium::value::Value;
use serde::{de::DeserializeOwned, Serialize};

/// Error types for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CborError {
    /// A value could not be serialized.
    #[error("serialization error: {0}")]
    Serialize(String),

    /// Input was not well-formed CBOR or did not match the target type.
    #[error("malformed CBOR: {0}")]
    Malformed(String),

    /// Input ended in the middle of an item.
    #[error("truncated CBOR input")]
    Truncated,

    /// A decoded item was not of the expected type.
    #[error("unexpected CBOR type: expected {0}")]
    UnexpectedType(&'static str),

    /// An integer fell outside the representable range of the target.
    #[error("integer overflow")]
    IntegerOverflow,

    /// Canonical mode found two identical map keys.
    #[error("duplicate map key")]
    DuplicateMapKey,
}

pub type Result<T> = std::result::Result<T, CborError>;

impl serde::ser::Error for CborError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        CborError::Serialize(msg.to_string())
    }
}

impl serde::de::Error for CborError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        CborError::Malformed(msg.to_string())
    }
}

/// Serialize a value into a [`Value`] tree using the struct-as-array
/// convention.
pub fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    value.serialize(ser::ValueSerializer)
}

/// Deserialize a value from a [`Value`] tree, accepting positional arrays
/// for named structs.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    T::deserialize(de::ValueDeserializer::new(value))
}

/// Serialize a value to CBOR bytes (deterministic heads, maps in insertion
/// order).
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let v = to_value(value)?;
    canonical::encode(&v, canonical::Mode::Deterministic)
}

/// Serialize a value to canonical CBOR bytes (map keys sorted, duplicates
/// rejected). Required for every payload that is signed or MACed.
pub fn canonical_to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let v = to_value(value)?;
    canonical::encode(&v, canonical::Mode::Canonical)
}

/// Deserialize a value from CBOR bytes.
pub fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let value = decode_value(data)?;
    from_value(value)
}

/// Decode CBOR bytes into a [`Value`] tree.
pub fn decode_value(data: &[u8]) -> Result<Value> {
    ciborium::from_reader(data).map_err(|e| match e {
        ciborium::de::Error::Io(_) => CborError::Truncated,
        other => CborError::Malformed(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_bytes::ByteBuf;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        count: u32,
        name: String,
        body: ByteBuf,
        note: Option<String>,
    }

    fn sample() -> Sample {
        Sample {
            count: 7,
            name: "device".into(),
            body: ByteBuf::from(vec![1, 2, 3]),
            note: None,
        }
    }

    #[test]
    fn test_struct_encodes_as_array() {
        let bytes = to_vec(&sample()).expect("serialize");
        // Definite array of 4: major type 4, length 4.
        assert_eq!(bytes[0], 0x84);
        // First element is the integer 7.
        assert_eq!(bytes[1], 0x07);
    }

    #[test]
    fn test_roundtrip() {
        let orig = sample();
        let bytes = to_vec(&orig).expect("serialize");
        let back: Sample = from_slice(&bytes).expect("deserialize");
        assert_eq!(orig, back);
    }

    #[test]
    fn test_some_option_roundtrip() {
        let mut s = sample();
        s.note = Some("spare".into());
        let bytes = to_vec(&s).expect("serialize");
        let back: Sample = from_slice(&bytes).expect("deserialize");
        assert_eq!(s, back);
    }

    #[test]
    fn test_bytes_encode_as_bstr() {
        let bytes = to_vec(&ByteBuf::from(vec![0xAA, 0xBB])).expect("serialize");
        assert_eq!(bytes, vec![0x42, 0xAA, 0xBB]);
    }

    #[test]
    fn test_truncated_input() {
        let bytes = to_vec(&sample()).expect("serialize");
        let result: Result<Sample> = from_slice(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(CborError::Truncated) | Err(CborError::Malformed(_))));
    }

    #[test]
    fn test_empty_input() {
        let result: Result<u8> = from_slice(&[]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cbor_is_compact() {
        let s = sample();
        let cbor = to_vec(&s).expect("serialize");
        let json = serde_json::to_vec(&s).expect("serialize json");
        assert!(cbor.len() <= json.len());
    }

    #[test]
    fn test_canonical_equals_plain_for_arrays() {
        // Wire messages carry no maps, so both modes agree on them.
        let s = sample();
        assert_eq!(to_vec(&s).expect("plain"), canonical_to_vec(&s).expect("canonical"));
    }
}
