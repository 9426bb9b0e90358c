//! Per-row change capture.
//!
//! The embedded engine exposes a pre-update hook that fires once per row a
//! statement touches, before the change lands. [`ChangeBuffer`] installs a
//! hook that accumulates those row changes for the duration of one writer
//! transaction; the writer drains the buffer after commit and hands the
//! changes to its registered callbacks.
//!
//! The hook only sees column values by position. Resolving positions into
//! named, typed key columns requires the table's schema, which
//! [`SchemaCache`] loads from the engine's table-info facility outside the
//! hook (the hook must not issue queries against the connection it observes).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use rusqlite::{
    hooks::{Action, PreUpdateCase},
    types::Value,
    Connection,
};
use snafu::ResultExt;

use super::{SqliteSnafu, WriterError};
use crate::schema::{FieldType, LDB_TABLE_SEPARATOR};

/// What a row change did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// One raw row change as captured by the pre-update hook.
///
/// `values` holds the full row by column position: the old row for updates
/// and deletes, the new row for inserts.
#[derive(Debug, Clone)]
pub struct RowChange {
    pub table: String,
    pub kind: ChangeKind,
    pub values: Vec<Value>,
}

/// A shared buffer of row changes for the current transaction.
#[derive(Debug, Clone, Default)]
pub struct ChangeBuffer {
    changes: Arc<Mutex<Vec<RowChange>>>,
}

impl ChangeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the pre-update hook on `conn`, feeding this buffer.
    ///
    /// Changes to tables that are not replicated user tables (no
    /// family/table separator in the name) are ignored, which keeps the
    /// bookkeeping tables out of the change stream.
    pub fn install(&self, conn: &Connection) {
        let changes = Arc::clone(&self.changes);
        conn.preupdate_hook(Some(
            move |action: Action, _db: &str, table: &str, case: &PreUpdateCase| {
                if !table.contains(LDB_TABLE_SEPARATOR) {
                    return;
                }
                let kind = match action {
                    Action::SQLITE_INSERT => ChangeKind::Insert,
                    Action::SQLITE_UPDATE => ChangeKind::Update,
                    Action::SQLITE_DELETE => ChangeKind::Delete,
                    _ => return,
                };
                let values = match case {
                    PreUpdateCase::Insert(accessor) => {
                        let count = accessor.get_column_count();
                        (0..count)
                            .map(|i| accessor.get_new_column_value(i).unwrap_or(Value::Null))
                            .collect()
                    }
                    PreUpdateCase::Delete(accessor) => {
                        let count = accessor.get_column_count();
                        (0..count)
                            .map(|i| accessor.get_old_column_value(i).unwrap_or(Value::Null))
                            .collect()
                    }
                    PreUpdateCase::Update {
                        old_value_accessor, ..
                    } => {
                        let count = old_value_accessor.get_column_count();
                        (0..count)
                            .map(|i| {
                                old_value_accessor
                                    .get_old_column_value(i)
                                    .unwrap_or(Value::Null)
                            })
                            .collect()
                    }
                    PreUpdateCase::Unknown => return,
                };
                changes.lock().expect("change buffer poisoned").push(RowChange {
                    table: table.to_string(),
                    kind,
                    values,
                });
            },
        ));
    }

    /// Drains the buffered changes.
    pub fn take(&self) -> Vec<RowChange> {
        std::mem::take(&mut *self.changes.lock().expect("change buffer poisoned"))
    }

    /// Discards the buffered changes (used when a transaction rolls back).
    pub fn clear(&self) {
        self.changes.lock().expect("change buffer poisoned").clear();
    }
}

/// One key column of a resolved change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeKeyColumn {
    pub name: String,
    pub field_type: FieldType,
    pub value: Value,
}

/// A row change with its key columns resolved against the table schema.
#[derive(Debug, Clone)]
pub struct KeyedChange {
    pub family_name: String,
    pub table_name: String,
    pub kind: ChangeKind,
    pub keys: Vec<ChangeKeyColumn>,
}

struct TableColumns {
    // (position, name, declared type, pk ordinal) for every column; pk
    // ordinal zero means the column is not part of the primary key.
    columns: Vec<(usize, String, String, i64)>,
}

/// Caches table-info lookups used to resolve hook output into key columns.
#[derive(Default)]
pub struct SchemaCache {
    tables: HashMap<String, TableColumns>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the cached schema of `table`, forcing a reload on next use.
    pub fn invalidate(&mut self, table: &str) {
        self.tables.remove(table);
    }

    fn load(conn: &Connection, table: &str) -> Result<TableColumns, WriterError> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
            .context(SqliteSnafu)?;
        let columns = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)? as usize,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .context(SqliteSnafu)?
            .collect::<Result<Vec<_>, _>>()
            .context(SqliteSnafu)?;
        Ok(TableColumns { columns })
    }

    /// Resolves a raw change into named, typed key columns.
    ///
    /// Tables without a primary key resolve to a change with no key columns.
    pub fn resolve(
        &mut self,
        conn: &Connection,
        change: &RowChange,
    ) -> Result<KeyedChange, WriterError> {
        let (family_name, table_name) = split_ldb_table(&change.table)?;
        if !self.tables.contains_key(&change.table) {
            let loaded = Self::load(conn, &change.table)?;
            self.tables.insert(change.table.clone(), loaded);
        }
        let schema = &self.tables[&change.table];

        let mut pk_columns: Vec<_> = schema
            .columns
            .iter()
            .filter(|(_, _, _, pk)| *pk > 0)
            .collect();
        pk_columns.sort_by_key(|(_, _, _, pk)| *pk);

        let mut keys = Vec::with_capacity(pk_columns.len());
        for (position, name, decl, _) in pk_columns {
            let field_type = FieldType::from_sql_type(decl).unwrap_or(FieldType::Blob);
            let value = change.values.get(*position).cloned().unwrap_or(Value::Null);
            keys.push(ChangeKeyColumn {
                name: name.clone(),
                field_type,
                value,
            });
        }
        if keys.is_empty() {
            tracing::warn!(
                message = "Change captured on a table without a primary key.",
                table = %change.table,
            );
        }
        Ok(KeyedChange {
            family_name,
            table_name,
            kind: change.kind,
            keys,
        })
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn split_ldb_table(ldb_table: &str) -> Result<(String, String), WriterError> {
    match ldb_table.split_once(LDB_TABLE_SEPARATOR) {
        Some((family, table)) if !family.is_empty() && !table.is_empty() => {
            Ok((family.to_string(), table.to_string()))
        }
        _ => Err(WriterError::NotUserTable {
            table: ldb_table.to_string(),
        }),
    }
}
