//! Naming and type model for replicated tables.
//!
//! A logical table in the control store is identified by a (family, table)
//! pair. Both halves are restricted identifiers, and the pair is composed
//! into a single LDB table name with a three-underscore join, so that the
//! halves can be recovered unambiguously.

use std::fmt;

use snafu::Snafu;

/// Joins a family name to a table name in LDB table names.
pub const LDB_TABLE_SEPARATOR: &str = "___";

/// Longest accepted family or table name, in bytes.
pub const MAX_NAME_LEN: usize = 30;

/// Error produced when validating family or table names.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum SchemaError {
    /// The name was empty.
    #[snafu(display("{kind} name cannot be empty"))]
    EmptyName { kind: &'static str },

    /// The name was longer than [`MAX_NAME_LEN`].
    #[snafu(display("{kind} name {name:?} is longer than {MAX_NAME_LEN} bytes"))]
    NameTooLong { kind: &'static str, name: String },

    /// The name contained a character outside `[a-z0-9_]`, or did not start
    /// with a letter.
    #[snafu(display("{kind} name {name:?} must match [a-z][a-z0-9_]*"))]
    InvalidName { kind: &'static str, name: String },
}

fn validate_name(kind: &'static str, name: &str) -> Result<(), SchemaError> {
    if name.is_empty() {
        return Err(SchemaError::EmptyName { kind });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(SchemaError::NameTooLong {
            kind,
            name: name.to_string(),
        });
    }
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !first_ok || !rest_ok {
        return Err(SchemaError::InvalidName {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

/// A validated family name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FamilyName(String);

impl FamilyName {
    pub fn new(name: impl Into<String>) -> Result<Self, SchemaError> {
        let name = name.into();
        validate_name("family", &name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FamilyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Result<Self, SchemaError> {
        let name = name.into();
        validate_name("table", &name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composes the name of the LDB table that holds a (family, table) pair.
pub fn ldb_table_name(family: &FamilyName, table: &TableName) -> String {
    format!("{}{}{}", family.as_str(), LDB_TABLE_SEPARATOR, table.as_str())
}

/// The fixed set of column types a replicated table can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    Integer,
    Real,
    Text,
    Binary,
    Varbinary,
    Bytestring,
    Blob,
}

impl FieldType {
    /// Maps a declared SQLite column type to a field type.
    ///
    /// Declared types come back from the engine's table-info facility in
    /// whatever case the DDL used, possibly with a length suffix such as
    /// `VARCHAR(191)`.
    pub fn from_sql_type(decl: &str) -> Option<Self> {
        let decl = decl.trim();
        let base = decl.split('(').next().unwrap_or(decl).trim();
        match base.to_ascii_uppercase().as_str() {
            "VARCHAR" | "STRING" | "CHAR" => Some(Self::String),
            "TEXT" | "CLOB" => Some(Self::Text),
            "INTEGER" | "INT" | "BIGINT" | "SMALLINT" | "TINYINT" => Some(Self::Integer),
            "REAL" | "DOUBLE" | "FLOAT" | "DECIMAL" | "NUMERIC" => Some(Self::Real),
            "BINARY" => Some(Self::Binary),
            "VARBINARY" => Some(Self::Varbinary),
            "BYTESTRING" => Some(Self::Bytestring),
            "BLOB" => Some(Self::Blob),
            _ => None,
        }
    }

    /// Whether values of this type are stored as raw bytes.
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            Self::Binary | Self::Varbinary | Self::Bytestring | Self::Blob
        )
    }

    /// Whether values of this type are strings even when the engine hands
    /// them back as byte arrays.
    pub fn is_string(self) -> bool {
        matches!(self, Self::String | Self::Text)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Varbinary => "varbinary",
            Self::Bytestring => "bytestring",
            Self::Blob => "blob",
        }
    }
}

/// One primary-key column: its name and declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeyColumn {
    pub name: String,
    pub field_type: FieldType,
}

/// The ordered primary key of a replicated table.
///
/// Discovered from the embedded engine's table-info facility and cached per
/// LDB handle. A table created without a primary key yields [`PrimaryKey::zero`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrimaryKey {
    columns: Vec<PrimaryKeyColumn>,
}

impl PrimaryKey {
    pub fn new(columns: Vec<PrimaryKeyColumn>) -> Self {
        Self { columns }
    }

    /// The primary key of a table that has none.
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[PrimaryKeyColumn] {
        &self.columns
    }
}

/// A key value supplied by a reader caller, prior to coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    Integer(i64),
    Real(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for KeyValue {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<f64> for KeyValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&[u8]> for KeyValue {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for KeyValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl KeyValue {
    /// Coerces this value for binding against a column of `field_type`.
    ///
    /// Binary-ish columns accept string keys by converting them to their raw
    /// bytes; everything else passes through untouched.
    pub fn coerce(self, field_type: FieldType) -> Self {
        match self {
            Self::Text(s) if field_type.is_binary() => Self::Bytes(s.into_bytes()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn family_name_validation() {
        assert!(FamilyName::new("foo").is_ok());
        assert!(FamilyName::new("foo_bar2").is_ok());
        assert_eq!(
            FamilyName::new(""),
            Err(SchemaError::EmptyName { kind: "family" })
        );
        assert!(matches!(
            FamilyName::new("Foo"),
            Err(SchemaError::InvalidName { .. })
        ));
        assert!(matches!(
            FamilyName::new("2foo"),
            Err(SchemaError::InvalidName { .. })
        ));
        assert!(matches!(
            FamilyName::new("foo-bar"),
            Err(SchemaError::InvalidName { .. })
        ));
        assert!(matches!(
            FamilyName::new("a".repeat(MAX_NAME_LEN + 1)),
            Err(SchemaError::NameTooLong { .. })
        ));
    }

    #[test]
    fn composes_ldb_table_name() {
        let family = FamilyName::new("foo").unwrap();
        let table = TableName::new("bar").unwrap();
        assert_eq!(ldb_table_name(&family, &table), "foo___bar");
    }

    #[test]
    fn field_type_from_declared_sql() {
        assert_eq!(
            FieldType::from_sql_type("VARCHAR(191)"),
            Some(FieldType::String)
        );
        assert_eq!(FieldType::from_sql_type("text"), Some(FieldType::Text));
        assert_eq!(FieldType::from_sql_type("INTEGER"), Some(FieldType::Integer));
        assert_eq!(
            FieldType::from_sql_type("VARBINARY(255)"),
            Some(FieldType::Varbinary)
        );
        assert_eq!(FieldType::from_sql_type("REAL"), Some(FieldType::Real));
        assert_eq!(FieldType::from_sql_type("GEOMETRY"), None);
    }

    #[test]
    fn string_keys_coerce_to_bytes_for_binary_columns() {
        let key = KeyValue::from("zzz").coerce(FieldType::Varbinary);
        assert_eq!(key, KeyValue::Bytes(b"zzz".to_vec()));

        let key = KeyValue::from("zzz").coerce(FieldType::String);
        assert_eq!(key, KeyValue::Text("zzz".to_string()));

        let key = KeyValue::from(7_i64).coerce(FieldType::Blob);
        assert_eq!(key, KeyValue::Integer(7));
    }
}
