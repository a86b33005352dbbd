//! Serde deserializer consuming a [`Value`] tree, accepting positional
//! arrays for named structs (the inverse of [`crate::ser`]). Maps are also
//! accepted for structs so store-side CBOR written by other tooling still
//! decodes.
//!
//! Tags are transparent: the decoder looks through them, since tagged
//! items (bignums, COSE tag 18) carry their meaning in the inner item for
//! every type this workspace decodes.

use ciborium::value::Value;
use serde::de::{self, DeserializeSeed, Deserializer, IntoDeserializer, Visitor};

use crate::CborError;

type Result<T> = std::result::Result<T, CborError>;

/// Deserializer over an owned [`Value`].
pub struct ValueDeserializer {
    value: Value,
}

impl ValueDeserializer {
    /// Wrap a decoded value, stripping any enclosing tags.
    pub fn new(value: Value) -> Self {
        Self { value: untag(value) }
    }
}

fn untag(mut value: Value) -> Value {
    while let Value::Tag(_, inner) = value {
        value = *inner;
    }
    value
}

impl ValueDeserializer {
    fn integer(self, target: &'static str) -> Result<i128> {
        match self.value {
            Value::Integer(i) => Ok(i.into()),
            _ => Err(CborError::UnexpectedType(target)),
        }
    }
}

macro_rules! deserialize_signed {
    ($method:ident, $visit:ident, $ty:ty) => {
        fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
            let n = self.integer(stringify!($ty))?;
            let n: $ty = n.try_into().map_err(|_| CborError::IntegerOverflow)?;
            visitor.$visit(n)
        }
    };
}

impl<'de> Deserializer<'de> for ValueDeserializer {
    type Error = CborError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Value::Integer(i) => {
                let n: i128 = i.into();
                if n >= 0 {
                    visitor.visit_u64(n.try_into().map_err(|_| CborError::IntegerOverflow)?)
                } else {
                    visitor.visit_i64(n.try_into().map_err(|_| CborError::IntegerOverflow)?)
                }
            }
            Value::Bytes(b) => visitor.visit_byte_buf(b),
            Value::Text(t) => visitor.visit_string(t),
            Value::Float(f) => visitor.visit_f64(f),
            Value::Bool(b) => visitor.visit_bool(b),
            Value::Null => visitor.visit_unit(),
            Value::Array(items) => visitor.visit_seq(SeqAccess::new(items)),
            Value::Map(entries) => visitor.visit_map(MapAccess::new(entries)),
            Value::Tag(_, inner) => ValueDeserializer::new(*inner).deserialize_any(visitor),
            _ => Err(CborError::UnexpectedType("supported CBOR value")),
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Value::Bool(b) => visitor.visit_bool(b),
            _ => Err(CborError::UnexpectedType("bool")),
        }
    }

    deserialize_signed!(deserialize_i8, visit_i8, i8);
    deserialize_signed!(deserialize_i16, visit_i16, i16);
    deserialize_signed!(deserialize_i32, visit_i32, i32);
    deserialize_signed!(deserialize_i64, visit_i64, i64);
    deserialize_signed!(deserialize_u8, visit_u8, u8);
    deserialize_signed!(deserialize_u16, visit_u16, u16);
    deserialize_signed!(deserialize_u32, visit_u32, u32);
    deserialize_signed!(deserialize_u64, visit_u64, u64);

    fn deserialize_i128<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_i128(self.integer("i128")?)
    }

    fn deserialize_u128<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        let n = self.integer("u128")?;
        visitor.visit_u128(n.try_into().map_err(|_| CborError::IntegerOverflow)?)
    }

    fn deserialize_f32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Value::Float(f) => visitor.visit_f32(f as f32),
            _ => Err(CborError::UnexpectedType("f32")),
        }
    }

    fn deserialize_f64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Value::Float(f) => visitor.visit_f64(f),
            _ => Err(CborError::UnexpectedType("f64")),
        }
    }

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Value::Text(t) => {
                let mut chars = t.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => visitor.visit_char(c),
                    _ => Err(CborError::UnexpectedType("single-character text")),
                }
            }
            _ => Err(CborError::UnexpectedType("char")),
        }
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Value::Text(t) => visitor.visit_string(t),
            _ => Err(CborError::UnexpectedType("text string")),
        }
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Value::Bytes(b) => visitor.visit_byte_buf(b),
            _ => Err(CborError::UnexpectedType("byte string")),
        }
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Value::Null => visitor.visit_none(),
            value => visitor.visit_some(ValueDeserializer { value }),
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Value::Null => visitor.visit_unit(),
            _ => Err(CborError::UnexpectedType("null")),
        }
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(self, _name: &'static str, visitor: V) -> Result<V::Value> {
        self.deserialize_unit(visitor)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(self, _name: &'static str, visitor: V) -> Result<V::Value> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Value::Array(items) => visitor.visit_seq(SeqAccess::new(items)),
            _ => Err(CborError::UnexpectedType("array")),
        }
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Value::Map(entries) => visitor.visit_map(MapAccess::new(entries)),
            _ => Err(CborError::UnexpectedType("map")),
        }
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value> {
        match self.value {
            // Positional: the FDO wire form.
            Value::Array(items) => visitor.visit_seq(SeqAccess::new(items)),
            // Named: tolerated for foreign CBOR.
            Value::Map(entries) => visitor.visit_map(MapAccess::new(entries)),
            _ => Err(CborError::UnexpectedType("array or map")),
        }
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value> {
        match self.value {
            Value::Text(t) => visitor.visit_enum(t.into_deserializer()),
            Value::Map(mut entries) => {
                if entries.len() != 1 {
                    return Err(CborError::UnexpectedType("single-entry variant map"));
                }
                let (key, value) = entries.remove(0);
                let variant = match key {
                    Value::Text(t) => t,
                    _ => return Err(CborError::UnexpectedType("text variant key")),
                };
                visitor.visit_enum(EnumAccess { variant, value })
            }
            _ => Err(CborError::UnexpectedType("enum")),
        }
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Value::Text(t) => visitor.visit_string(t),
            Value::Integer(i) => {
                let n: i128 = i.into();
                visitor.visit_u64(n.try_into().map_err(|_| CborError::IntegerOverflow)?)
            }
            _ => Err(CborError::UnexpectedType("identifier")),
        }
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_unit()
    }

    fn is_human_readable(&self) -> bool {
        false
    }
}

struct SeqAccess {
    iter: std::vec::IntoIter<Value>,
}

impl SeqAccess {
    fn new(items: Vec<Value>) -> Self {
        Self {
            iter: items.into_iter(),
        }
    }
}

impl<'de> de::SeqAccess<'de> for SeqAccess {
    type Error = CborError;

    fn next_element_seed<T: DeserializeSeed<'de>>(&mut self, seed: T) -> Result<Option<T::Value>> {
        match self.iter.next() {
            Some(value) => seed.deserialize(ValueDeserializer::new(value)).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct MapAccess {
    iter: std::vec::IntoIter<(Value, Value)>,
    pending: Option<Value>,
}

impl MapAccess {
    fn new(entries: Vec<(Value, Value)>) -> Self {
        Self {
            iter: entries.into_iter(),
            pending: None,
        }
    }
}

impl<'de> de::MapAccess<'de> for MapAccess {
    type Error = CborError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>> {
        match self.iter.next() {
            Some((key, value)) => {
                self.pending = Some(value);
                seed.deserialize(ValueDeserializer::new(key)).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value> {
        let value = self
            .pending
            .take()
            .ok_or_else(|| CborError::Malformed("map value without key".into()))?;
        seed.deserialize(ValueDeserializer::new(value))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct EnumAccess {
    variant: String,
    value: Value,
}

impl<'de> de::EnumAccess<'de> for EnumAccess {
    type Error = CborError;
    type Variant = VariantAccess;

    fn variant_seed<V: DeserializeSeed<'de>>(self, seed: V) -> Result<(V::Value, VariantAccess)> {
        let variant = seed.deserialize(self.variant.into_deserializer())?;
        Ok((variant, VariantAccess { value: self.value }))
    }
}

struct VariantAccess {
    value: Value,
}

impl<'de> de::VariantAccess<'de> for VariantAccess {
    type Error = CborError;

    fn unit_variant(self) -> Result<()> {
        match self.value {
            Value::Null => Ok(()),
            _ => Err(CborError::UnexpectedType("unit variant")),
        }
    }

    fn newtype_variant_seed<T: DeserializeSeed<'de>>(self, seed: T) -> Result<T::Value> {
        seed.deserialize(ValueDeserializer::new(self.value))
    }

    fn tuple_variant<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value> {
        match self.value {
            Value::Array(items) => visitor.visit_seq(SeqAccess::new(items)),
            _ => Err(CborError::UnexpectedType("tuple variant")),
        }
    }

    fn struct_variant<V: Visitor<'de>>(self, _fields: &'static [&'static str], visitor: V) -> Result<V::Value> {
        match self.value {
            Value::Array(items) => visitor.visit_seq(SeqAccess::new(items)),
            Value::Map(entries) => visitor.visit_map(MapAccess::new(entries)),
            _ => Err(CborError::UnexpectedType("struct variant")),
        }
    }
}
