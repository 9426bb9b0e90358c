//! Values read out of the LDB.

use serde::{de::Visitor, Deserialize, Serialize};

use crate::schema::FieldType;

/// One column's worth of data from an LDB row.
///
/// String columns with byte-array underlying representations are coerced to
/// strings at scan time; binary/varbinary columns stay byte arrays.
#[derive(Debug, Clone, PartialEq)]
pub enum LdbValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl LdbValue {
    /// Converts an engine value, honoring the column's declared type.
    pub fn from_sqlite(value: rusqlite::types::ValueRef<'_>, field_type: Option<FieldType>) -> Self {
        use rusqlite::types::ValueRef;
        match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(i) => Self::Integer(i),
            ValueRef::Real(r) => Self::Real(r),
            ValueRef::Text(bytes) => match field_type {
                Some(t) if t.is_binary() => Self::Bytes(bytes.to_vec()),
                _ => Self::Text(String::from_utf8_lossy(bytes).into_owned()),
            },
            ValueRef::Blob(bytes) => match field_type {
                Some(t) if t.is_string() => Self::Text(String::from_utf8_lossy(bytes).into_owned()),
                _ => Self::Bytes(bytes.to_vec()),
            },
        }
    }
}

impl Serialize for LdbValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_none(),
            Self::Integer(i) => serializer.serialize_i64(*i),
            Self::Real(r) => serializer.serialize_f64(*r),
            Self::Text(s) => serializer.serialize_str(s),
            Self::Bytes(b) => serializer.serialize_bytes(b),
        }
    }
}

struct LdbValueVisitor;

impl<'de> Visitor<'de> for LdbValueVisitor {
    type Value = LdbValue;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("an ldb value")
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
        Ok(LdbValue::Integer(v))
    }

    fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
        i64::try_from(v)
            .map(LdbValue::Integer)
            .map_err(|_| E::custom("integer out of range"))
    }

    fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E> {
        Ok(LdbValue::Real(v))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
        Ok(LdbValue::Text(v.to_string()))
    }

    fn visit_string<E>(self, v: String) -> Result<Self::Value, E> {
        Ok(LdbValue::Text(v))
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E> {
        Ok(LdbValue::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E> {
        Ok(LdbValue::Bytes(v))
    }

    fn visit_none<E>(self) -> Result<Self::Value, E> {
        Ok(LdbValue::Null)
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E> {
        Ok(LdbValue::Null)
    }

    fn visit_some<D: serde::Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Deserialize<'de> for LdbValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(LdbValueVisitor)
    }
}
