//! The rows cursor returned by prefix queries.

use serde::de::{DeserializeOwned, Error as _};

use super::{
    de::{scan_row, ScanError},
    value::LdbValue,
};
use crate::schema::FieldType;

/// One declared result column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    /// `None` when the column carries no declared type (expressions,
    /// engine-computed columns); values then scan by their storage class.
    pub field_type: Option<FieldType>,
}

/// A cursor over the rows a prefix query matched.
///
/// The result set is captured when the query executes, so a cursor stays
/// valid after the reader hot-swaps or rotates to a different LDB. Usage
/// follows the advance/scan shape:
///
/// ```ignore
/// let mut rows = reader.get_rows_by_key_prefix("foo", "bar", &[])?;
/// while rows.advance() {
///     let row: HashMap<String, LdbValue> = rows.scan()?;
/// }
/// ```
pub struct LdbRows {
    columns: Vec<Column>,
    rows: std::vec::IntoIter<Vec<LdbValue>>,
    current: Option<Vec<LdbValue>>,
    err: Option<ScanError>,
}

impl LdbRows {
    pub(super) fn new(columns: Vec<Column>, rows: Vec<Vec<LdbValue>>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
            current: None,
            err: None,
        }
    }

    /// The declared columns of the result set.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Moves to the next row; `false` once the result set is exhausted.
    pub fn advance(&mut self) -> bool {
        self.current = self.rows.next();
        self.current.is_some()
    }

    /// The error recorded by the last failing [`LdbRows::scan`], if any.
    pub fn err(&self) -> Option<&ScanError> {
        self.err.as_ref()
    }

    /// Scans the current row into a target.
    pub fn scan<T: DeserializeOwned>(&mut self) -> Result<T, ScanError> {
        let row = self
            .current
            .as_ref()
            .ok_or_else(|| serde::de::Error::custom("scan called before advance"))?;
        match scan_row(&self.columns, row) {
            Ok(target) => Ok(target),
            Err(err) => {
                self.err = Some(ScanError::custom(err.to_string()));
                Err(err)
            }
        }
    }

    /// Releases the cursor. Equivalent to dropping it.
    pub fn close(self) {}
}
