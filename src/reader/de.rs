//! Scanning rows into caller targets.
//!
//! A row scan drives serde: the declared columns become map keys and the
//! column values their entries, so a target can be a mapping
//! (`HashMap<String, LdbValue>`) or a record type deriving `Deserialize`
//! whose fields (or `#[serde(rename)]` tags) name the columns. Columns the
//! target does not declare are ignored.

use std::fmt;

use serde::{
    de::{self, DeserializeOwned, IntoDeserializer, MapAccess, Visitor},
    forward_to_deserialize_any,
};

use super::{rows::Column, value::LdbValue};

/// Error produced while scanning a row into a target.
#[derive(Debug)]
pub struct ScanError(String);

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row scan error: {}", self.0)
    }
}

impl std::error::Error for ScanError {}

impl de::Error for ScanError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

/// Scans one row into any `Deserialize` target.
pub fn scan_row<T: DeserializeOwned>(
    columns: &[Column],
    values: &[LdbValue],
) -> Result<T, ScanError> {
    T::deserialize(RowDeserializer { columns, values })
}

struct RowDeserializer<'de> {
    columns: &'de [Column],
    values: &'de [LdbValue],
}

impl<'de> de::Deserializer<'de> for RowDeserializer<'de> {
    type Error = ScanError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ScanError> {
        visitor.visit_map(RowAccess {
            columns: self.columns,
            values: self.values,
            index: 0,
        })
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct map struct enum identifier ignored_any
    }
}

struct RowAccess<'de> {
    columns: &'de [Column],
    values: &'de [LdbValue],
    index: usize,
}

impl<'de> MapAccess<'de> for RowAccess<'de> {
    type Error = ScanError;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, ScanError>
    where
        K: de::DeserializeSeed<'de>,
    {
        if self.index >= self.columns.len() {
            return Ok(None);
        }
        let name = self.columns[self.index].name.as_str();
        seed.deserialize(name.into_deserializer()).map(Some)
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, ScanError>
    where
        V: de::DeserializeSeed<'de>,
    {
        let value = self
            .values
            .get(self.index)
            .ok_or_else(|| de::Error::custom("row is narrower than its declared columns"))?;
        self.index += 1;
        seed.deserialize(ValueDeserializer { value })
    }
}

struct ValueDeserializer<'de> {
    value: &'de LdbValue,
}

impl<'de> de::Deserializer<'de> for ValueDeserializer<'de> {
    type Error = ScanError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ScanError> {
        match self.value {
            LdbValue::Null => visitor.visit_unit(),
            LdbValue::Integer(i) => visitor.visit_i64(*i),
            LdbValue::Real(r) => visitor.visit_f64(*r),
            LdbValue::Text(s) => visitor.visit_str(s),
            LdbValue::Bytes(b) => visitor.visit_bytes(b),
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ScanError> {
        match self.value {
            LdbValue::Null => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    // Byte-array columns also deserialize into sequence targets such as
    // `Vec<u8>`, which serde models as a seq of integers.
    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ScanError> {
        match self.value {
            LdbValue::Bytes(bytes) => {
                visitor.visit_seq(de::value::SeqDeserializer::new(bytes.iter().copied()))
            }
            LdbValue::Text(text) => {
                visitor.visit_seq(de::value::SeqDeserializer::new(text.bytes()))
            }
            other => Err(de::Error::custom(format!(
                "cannot scan {other:?} into a sequence"
            ))),
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, ScanError> {
        visitor.visit_newtype_struct(self)
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct tuple tuple_struct map struct enum
        identifier ignored_any
    }
}
