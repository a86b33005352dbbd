//! Opaque CBOR values: exact-bytes preservation across verification.
//!
//! COSE `Sig_structure`s and voucher entry hashes must operate on the wire
//! bytes, never a re-encoding. Substructures that need this travel
//! byte-string-wrapped ("bstr .cbor"): the outer item is a plain byte
//! string whose content is the encoded inner item, so the exact encoded
//! form survives any number of decode/verify round trips.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::ByteBuf;

use crate::Result;

/// An already-encoded CBOR item carried opaquely.
///
/// Serializes as a byte string containing the encoded item. Hash the
/// result of [`RawCbor::as_slice`]; decode on demand with
/// [`RawCbor::decode`]. The inner bytes are never re-serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct RawCbor(Vec<u8>);

impl RawCbor {
    /// Wrap already-encoded CBOR bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Encode a value canonically and wrap the result.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self(crate::canonical_to_vec(value)?))
    }

    /// The exact encoded bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Consume into the encoded bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the wrapped encoding is empty (never true for a valid item).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode the wrapped item.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        crate::from_slice(&self.0)
    }
}

impl std::fmt::Debug for RawCbor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RawCbor({} bytes)", self.0.len())
    }
}

impl Serialize for RawCbor {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for RawCbor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes = ByteBuf::deserialize(deserializer)?;
        Ok(Self(bytes.into_vec()))
    }
}

/// A decoded value together with the exact bytes it was decoded from.
///
/// Used where a payload must be both interpreted and re-verified later:
/// the value side feeds the protocol logic, the raw side feeds hashes and
/// signatures. Constructing from a value encodes canonically once and
/// freezes those bytes.
#[derive(Clone, Debug)]
pub struct CborBstr<T> {
    value: T,
    raw: Vec<u8>,
}

impl<T> CborBstr<T> {
    /// The decoded value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// The exact encoded bytes of the inner item.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Consume into the decoded value.
    pub fn into_value(self) -> T {
        self.value
    }
}

impl<T: Serialize> CborBstr<T> {
    /// Encode `value` canonically and freeze the bytes.
    pub fn new(value: T) -> Result<Self> {
        let raw = crate::canonical_to_vec(&value)?;
        Ok(Self { value, raw })
    }
}

impl<T: DeserializeOwned> CborBstr<T> {
    /// Adopt received bytes, decoding the inner item.
    pub fn from_raw(raw: Vec<u8>) -> Result<Self> {
        let value = crate::from_slice(&raw)?;
        Ok(Self { value, raw })
    }
}

impl<T> Serialize for CborBstr<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.raw)
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for CborBstr<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes = ByteBuf::deserialize(deserializer)?;
        CborBstr::from_raw(bytes.into_vec()).map_err(serde::de::Error::custom)
    }
}

/// Alias kept close to the CDDL: `bstr .cbor T`.
pub type TaggedBytes<T> = CborBstr<T>;
