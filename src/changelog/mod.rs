//! The on-disk change log.
//!
//! Each applied DML statement that touches replicated rows appends one JSON
//! line per row change, in applied-sequence order:
//!
//! ```json
//! {"seq":42,"family":"foo","table":"bar","key":[{"name":"key","type":"string","value":"zzz"}]}
//! ```
//!
//! The log is a size-limited rotating file consumed by a change-log emitter
//! on the same host. Writing it is best effort: a change-log write failure
//! is logged and counted but never fails the apply that produced it.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use base64::Engine;
use rusqlite::types::Value;
use serde::Serialize;
use snafu::{ResultExt, Snafu};

use crate::{
    internal_events::{emit, ChangelogEntryWritten, ChangelogRotated},
    source::DmlStatement,
    writer::KeyedChange,
};

/// Default size bound of the change-log file.
pub const DEFAULT_CHANGELOG_MAX_SIZE: u64 = 100 * 1024 * 1024;

/// Error raised by change-log writes.
#[derive(Debug, Snafu)]
pub enum ChangelogError {
    #[snafu(display("changelog I/O error on {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One key column of a change-log entry.
#[derive(Debug, Serialize, PartialEq)]
pub struct ChangelogKey {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub value: serde_json::Value,
}

/// One line of the change log.
#[derive(Debug, Serialize, PartialEq)]
pub struct ChangelogEntry {
    pub seq: i64,
    pub family: String,
    pub table: String,
    pub key: Vec<ChangelogKey>,
}

impl ChangelogEntry {
    pub fn from_change(seq: i64, change: &KeyedChange) -> Self {
        Self {
            seq,
            family: change.family_name.clone(),
            table: change.table_name.clone(),
            key: change
                .keys
                .iter()
                .map(|key| ChangelogKey {
                    name: key.name.clone(),
                    field_type: key.field_type.as_str().to_string(),
                    value: json_value(&key.value),
                })
                .collect(),
        }
    }
}

fn json_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Real(r) => serde_json::Value::from(*r),
        Value::Text(s) => serde_json::Value::from(s.clone()),
        Value::Blob(b) => {
            serde_json::Value::from(base64::engine::general_purpose::STANDARD.encode(b))
        }
    }
}

/// A line writer bounded by file size.
///
/// When appending a line would push the file past `max_size`, the file is
/// rotated: the current contents are dropped and the log starts over. The
/// consumer is expected to tail the file faster than it rotates.
pub struct RotatingFileWriter {
    path: PathBuf,
    max_size: u64,
    file: Option<File>,
    size: u64,
}

impl RotatingFileWriter {
    pub fn new(path: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            path: path.into(),
            max_size: max_size.max(1),
            file: None,
            size: 0,
        }
    }

    fn ensure_open(&mut self) -> Result<(), ChangelogError> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .context(IoSnafu { path: self.path.clone() })?;
            self.size = file
                .metadata()
                .context(IoSnafu { path: self.path.clone() })?
                .len();
            self.file = Some(file);
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), ChangelogError> {
        let dropped = self.size;
        self.file = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .context(IoSnafu { path: self.path.clone() })?;
        self.file = Some(file);
        self.size = 0;
        emit(ChangelogRotated {
            dropped_bytes: dropped,
        });
        Ok(())
    }

    /// Appends one line (a trailing newline is added).
    pub fn write_line(&mut self, line: &[u8]) -> Result<(), ChangelogError> {
        self.ensure_open()?;
        let needed = line.len() as u64 + 1;
        if self.size + needed > self.max_size {
            self.rotate()?;
        }
        let file = self.file.as_mut().expect("file opened above");
        file.write_all(line)
            .context(IoSnafu { path: self.path.clone() })?;
        file.write_all(b"\n")
            .context(IoSnafu { path: self.path.clone() })?;
        self.size += needed;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The writer callback that feeds the change log.
pub struct ChangelogCallback {
    writer: RotatingFileWriter,
}

impl ChangelogCallback {
    pub fn new(path: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            writer: RotatingFileWriter::new(path, max_size),
        }
    }

    /// Serializes and appends one entry per row change.
    ///
    /// Entries appear in the same order the changes were captured, which is
    /// the order the applied statements produced them.
    pub fn on_apply(&mut self, statement: &DmlStatement, changes: &[KeyedChange]) {
        for change in changes {
            let entry = ChangelogEntry::from_change(statement.sequence, change);
            let line = match serde_json::to_vec(&entry) {
                Ok(line) => line,
                Err(error) => {
                    tracing::warn!(
                        message = "Failed to serialize changelog entry.",
                        sequence = statement.sequence,
                        error = %error,
                    );
                    continue;
                }
            };
            if let Err(error) = self.writer.write_line(&line) {
                tracing::warn!(
                    message = "Failed to write changelog entry.",
                    sequence = statement.sequence,
                    error = %error,
                );
                return;
            }
            emit(ChangelogEntryWritten {
                sequence: statement.sequence,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        schema::FieldType,
        writer::{ChangeKeyColumn, ChangeKind},
    };

    fn change(family: &str, table: &str, key: &str) -> KeyedChange {
        KeyedChange {
            family_name: family.to_string(),
            table_name: table.to_string(),
            kind: ChangeKind::Insert,
            keys: vec![ChangeKeyColumn {
                name: "key".to_string(),
                field_type: FieldType::String,
                value: Value::Text(key.to_string()),
            }],
        }
    }

    #[test]
    fn entry_serializes_to_the_wire_shape() {
        let entry = ChangelogEntry::from_change(42, &change("foo", "bar", "zzz"));
        assert_eq!(
            serde_json::to_string(&entry).unwrap(),
            r#"{"seq":42,"family":"foo","table":"bar","key":[{"name":"key","type":"string","value":"zzz"}]}"#
        );
    }

    #[test]
    fn blob_keys_encode_as_base64() {
        let entry = ChangelogEntry {
            seq: 1,
            family: "f".to_string(),
            table: "t".to_string(),
            key: vec![ChangelogKey {
                name: "k".to_string(),
                field_type: "varbinary".to_string(),
                value: json_value(&Value::Blob(b"zzz".to_vec())),
            }],
        };
        let line = serde_json::to_string(&entry).unwrap();
        assert!(line.contains("\"enp6\""));
    }

    #[test]
    fn writer_appends_lines_until_the_size_bound() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("changelog");
        let mut writer = RotatingFileWriter::new(&path, 64);
        writer.write_line(b"0123456789012345678901234567890123456789").unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first.lines().count(), 1);

        // The next line would exceed the bound, so the file starts over.
        writer.write_line(b"0123456789012345678901234567890123456789").unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(second.lines().count(), 1);
    }

    #[test]
    fn callback_writes_one_line_per_row_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("changelog");
        let mut callback = ChangelogCallback::new(&path, DEFAULT_CHANGELOG_MAX_SIZE);
        let statement = DmlStatement {
            sequence: 7,
            timestamp: chrono::Utc::now(),
            family_name: "foo".to_string(),
            table_name: "bar".to_string(),
            statement: "INSERT ...".to_string(),
        };
        callback.on_apply(&statement, &[change("foo", "bar", "a"), change("foo", "bar", "b")]);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""value":"a""#));
        assert!(lines[1].contains(r#""value":"b""#));
    }
}
