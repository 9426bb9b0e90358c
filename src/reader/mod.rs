//! The in-process read API.
//!
//! Applications read replicated data straight out of the LDB file through an
//! [`LdbReader`]. Reads resolve the logical `(family, table)` pair to an LDB
//! table, discover and cache the table's primary key, bind coerced key
//! values against cached statements, and scan the result into the caller's
//! target type.
//!
//! Three reader flavors share the same capability set ([`RowReader`]):
//!
//! - [`LdbReader`] serves a single LDB file.
//! - [`VersionedLdbReader`] watches a directory of timestamped LDBs and
//!   hot-swaps to the newest.
//! - [`RotatingLdbReader`] distributes read load across several LDB replicas
//!   on a minute-accurate schedule.
//!
//! ## Cancellation
//!
//! Reader operations deliberately run the underlying engine call without a
//! cancellation token: interrupting the engine mid-query is less safe than
//! letting a microsecond-scale read finish. Cancellation is honored around
//! lock acquisition and between cursor steps only.

use std::{collections::HashMap, path::Path, time::Duration};

use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use snafu::{ResultExt, Snafu};

mod de;
mod global;
mod rotating;
mod rows;
mod value;
mod versioned;

pub use self::{
    de::ScanError,
    global::{global_reader, reset_global_reader},
    rotating::{default_rotation_paths, RotatingLdbReader, RotationError, ROTATION_PERIODS},
    rows::{Column, LdbRows},
    value::LdbValue,
    versioned::VersionedLdbReader,
};
use crate::{
    internal_events::{emit, FullTableScan},
    ldb::{fetch_seq, ledger_latency, LdbError, SEQ_ROW_ID, SEQ_TABLE},
    schema::{ldb_table_name, FamilyName, FieldType, KeyValue, PrimaryKey, PrimaryKeyColumn, SchemaError, TableName},
};

/// Error surfaced by reader operations.
#[derive(Debug, Snafu)]
pub enum ReaderError {
    /// No LDB table exists for the requested (family, table) pair.
    #[snafu(display("table {family}.{table} not found"))]
    TableNotFound { family: String, table: String },

    /// A full-key lookup was called with the wrong number of key values.
    #[snafu(display("a full key requires {expected} key values, got {got}"))]
    NeedFullKey { expected: usize, got: usize },

    /// A prefix query supplied more key values than the primary key has
    /// columns.
    #[snafu(display("too many keys: primary key has {max} columns, got {got}"))]
    TooManyKeys { max: usize, got: usize },

    /// Key lookups require a primary key; the table has none.
    #[snafu(display("table {table} has no primary key"))]
    TableHasNoPrimaryKey { table: String },

    /// The ledger has never been applied to this LDB.
    #[snafu(display("no ledger updates have been received yet"))]
    NoLedgerUpdates,

    /// The requested family or table name is malformed.
    #[snafu(display("invalid name: {source}"))]
    InvalidName { source: SchemaError },

    /// The underlying engine call failed.
    #[snafu(display("ldb reader error: {source}"))]
    Sqlite { source: rusqlite::Error },

    /// LDB bookkeeping failed.
    #[snafu(display("ldb reader error: {source}"))]
    Ldb { source: LdbError },

    /// Scanning a row into the target failed.
    #[snafu(display("{source}"))]
    Scan { source: ScanError },

    /// No usable LDB was found where one was expected.
    #[snafu(display("no ldb found under {path:?}"))]
    NoLdbFound { path: String },
}

/// The capability set shared by all reader flavors.
pub trait RowReader {
    /// Looks up a single row by its full primary key.
    fn get_row_by_key<T: DeserializeOwned>(
        &self,
        family: &str,
        table: &str,
        keys: &[KeyValue],
    ) -> Result<Option<T>, ReaderError>;

    /// Returns all rows whose primary key starts with the given prefix.
    ///
    /// Zero keys scan the whole table.
    fn get_rows_by_key_prefix(
        &self,
        family: &str,
        table: &str,
        keys: &[KeyValue],
    ) -> Result<LdbRows, ReaderError>;
}

struct ReaderInner {
    conn: Connection,
    pk_cache: HashMap<String, PrimaryKey>,
    full_key_sql: HashMap<String, String>,
    prefix_sql: HashMap<(String, usize), String>,
}

impl ReaderInner {
    fn new(conn: Connection) -> Self {
        Self {
            conn,
            pk_cache: HashMap::new(),
            full_key_sql: HashMap::new(),
            prefix_sql: HashMap::new(),
        }
    }

    /// Drops every cache entry touching `ldb_table`.
    ///
    /// Called on any engine error against that table, so stale schema never
    /// outlives a DDL change.
    fn invalidate(&mut self, ldb_table: &str) {
        self.pk_cache.remove(ldb_table);
        self.full_key_sql.remove(ldb_table);
        self.prefix_sql.retain(|(table, _), _| table != ldb_table);
    }

    fn primary_key(
        &mut self,
        ldb_table: &str,
        family: &str,
        table: &str,
    ) -> Result<PrimaryKey, ReaderError> {
        if let Some(pk) = self.pk_cache.get(ldb_table) {
            return Ok(pk.clone());
        }
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(ldb_table)))
            .context(SqliteSnafu)?;
        let mut columns: Vec<(String, String, i64)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .context(SqliteSnafu)?
            .collect::<Result<_, _>>()
            .context(SqliteSnafu)?;
        if columns.is_empty() {
            return Err(ReaderError::TableNotFound {
                family: family.to_string(),
                table: table.to_string(),
            });
        }
        columns.retain(|(_, _, pk)| *pk > 0);
        columns.sort_by_key(|(_, _, pk)| *pk);
        let pk = PrimaryKey::new(
            columns
                .into_iter()
                .map(|(name, decl, _)| PrimaryKeyColumn {
                    field_type: FieldType::from_sql_type(&decl).unwrap_or(FieldType::Blob),
                    name,
                })
                .collect(),
        );
        self.pk_cache.insert(ldb_table.to_string(), pk.clone());
        Ok(pk)
    }

    fn full_key_sql(&mut self, ldb_table: &str, pk: &PrimaryKey) -> String {
        if let Some(sql) = self.full_key_sql.get(ldb_table) {
            return sql.clone();
        }
        let sql = select_sql(ldb_table, pk, pk.len());
        self.full_key_sql.insert(ldb_table.to_string(), sql.clone());
        sql
    }

    fn prefix_sql(&mut self, ldb_table: &str, pk: &PrimaryKey, num_keys: usize) -> String {
        let cache_key = (ldb_table.to_string(), num_keys);
        if let Some(sql) = self.prefix_sql.get(&cache_key) {
            return sql.clone();
        }
        let sql = select_sql(ldb_table, pk, num_keys);
        self.prefix_sql.insert(cache_key, sql.clone());
        sql
    }

    fn query(
        &mut self,
        ldb_table: &str,
        sql: &str,
        params: Vec<rusqlite::types::Value>,
    ) -> Result<(Vec<Column>, Vec<Vec<LdbValue>>), ReaderError> {
        match run_query(&self.conn, sql, params) {
            Ok(result) => Ok(result),
            Err(source) => {
                self.invalidate(ldb_table);
                Err(ReaderError::Sqlite { source })
            }
        }
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn select_sql(ldb_table: &str, pk: &PrimaryKey, num_keys: usize) -> String {
    let mut sql = format!("SELECT * FROM {}", quote_ident(ldb_table));
    let clauses: Vec<String> = pk
        .columns()
        .iter()
        .take(num_keys)
        .map(|col| format!("{} = ?", quote_ident(&col.name)))
        .collect();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql
}

fn run_query(
    conn: &Connection,
    sql: &str,
    params: Vec<rusqlite::types::Value>,
) -> Result<(Vec<Column>, Vec<Vec<LdbValue>>), rusqlite::Error> {
    let mut stmt = conn.prepare_cached(sql)?;
    let columns: Vec<Column> = stmt
        .columns()
        .iter()
        .map(|col| Column {
            name: col.name().to_string(),
            field_type: col.decl_type().and_then(FieldType::from_sql_type),
        })
        .collect();
    let mut rows = stmt.query(params_from_iter(params))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for (index, column) in columns.iter().enumerate() {
            values.push(LdbValue::from_sqlite(
                row.get_ref(index)?,
                column.field_type,
            ));
        }
        out.push(values);
    }
    Ok((columns, out))
}

fn to_sql_value(key: KeyValue) -> rusqlite::types::Value {
    use rusqlite::types::Value;
    match key {
        KeyValue::Integer(i) => Value::Integer(i),
        KeyValue::Real(r) => Value::Real(r),
        KeyValue::Text(s) => Value::Text(s),
        KeyValue::Bytes(b) => Value::Blob(b),
    }
}

fn resolve_names(family: &str, table: &str) -> Result<String, ReaderError> {
    let family = FamilyName::new(family).context(InvalidNameSnafu)?;
    let table = TableName::new(table).context(InvalidNameSnafu)?;
    Ok(ldb_table_name(&family, &table))
}

/// Reads a single LDB file.
///
/// Safe for concurrent use; the engine handle and all caches sit behind one
/// lock, swapped atomically on hot-swap.
pub struct LdbReader {
    inner: Mutex<ReaderInner>,
}

impl LdbReader {
    /// Opens the LDB at `path`, creating an empty file when none exists yet
    /// (reads against it simply find nothing and `ping` stays false).
    pub fn open(path: &Path) -> Result<Self, ReaderError> {
        let conn = Connection::open(path).context(SqliteSnafu)?;
        conn.busy_timeout(Duration::from_secs(10)).context(SqliteSnafu)?;
        Ok(Self {
            inner: Mutex::new(ReaderInner::new(conn)),
        })
    }

    /// Replaces the underlying engine handle, discarding the primary-key
    /// cache and every cached statement.
    pub(crate) fn swap_connection(&self, conn: Connection) {
        let mut inner = self.inner.lock();
        *inner = ReaderInner::new(conn);
    }

    /// True iff the sequence row is readable and non-null.
    pub fn ping(&self) -> bool {
        let inner = self.inner.lock();
        let seq: Result<Option<i64>, _> = inner
            .conn
            .query_row(
                &format!("SELECT seq FROM {SEQ_TABLE} WHERE id = ?"),
                [SEQ_ROW_ID],
                |row| row.get(0),
            )
            .optional();
        matches!(seq, Ok(Some(_)))
    }

    /// The highest ledger sequence applied to this LDB.
    pub fn get_last_sequence(&self) -> Result<i64, ReaderError> {
        let inner = self.inner.lock();
        Ok(fetch_seq(&inner.conn).context(LdbSnafu)?.unwrap_or(0))
    }

    /// How far this LDB trails the ledger.
    pub fn get_ledger_latency(&self) -> Result<Duration, ReaderError> {
        let inner = self.inner.lock();
        ledger_latency(&inner.conn).map_err(|err| match err {
            LdbError::NoLedgerUpdates => ReaderError::NoLedgerUpdates,
            other => ReaderError::Ldb { source: other },
        })
    }

    /// Releases the reader and its cached statements.
    pub fn close(self) {}
}

impl RowReader for LdbReader {
    fn get_row_by_key<T: DeserializeOwned>(
        &self,
        family: &str,
        table: &str,
        keys: &[KeyValue],
    ) -> Result<Option<T>, ReaderError> {
        let ldb_table = resolve_names(family, table)?;
        let mut inner = self.inner.lock();
        let pk = inner.primary_key(&ldb_table, family, table)?;
        if pk.is_zero() {
            return Err(ReaderError::TableHasNoPrimaryKey { table: ldb_table });
        }
        if keys.len() != pk.len() {
            return Err(ReaderError::NeedFullKey {
                expected: pk.len(),
                got: keys.len(),
            });
        }
        let params = coerce_keys(keys, &pk);
        let sql = inner.full_key_sql(&ldb_table, &pk);
        let (columns, rows) = inner.query(&ldb_table, &sql, params)?;
        match rows.first() {
            None => Ok(None),
            Some(row) => de::scan_row(&columns, row)
                .map(Some)
                .map_err(|source| ReaderError::Scan { source }),
        }
    }

    fn get_rows_by_key_prefix(
        &self,
        family: &str,
        table: &str,
        keys: &[KeyValue],
    ) -> Result<LdbRows, ReaderError> {
        let ldb_table = resolve_names(family, table)?;
        let mut inner = self.inner.lock();
        let pk = inner.primary_key(&ldb_table, family, table)?;
        if pk.is_zero() {
            return Err(ReaderError::TableHasNoPrimaryKey { table: ldb_table });
        }
        if keys.len() > pk.len() {
            return Err(ReaderError::TooManyKeys {
                max: pk.len(),
                got: keys.len(),
            });
        }
        if keys.is_empty() {
            emit(FullTableScan {
                ldb_table: ldb_table.clone(),
            });
        }
        let params = coerce_keys(keys, &pk);
        let sql = inner.prefix_sql(&ldb_table, &pk, keys.len());
        let (columns, rows) = inner.query(&ldb_table, &sql, params)?;
        Ok(LdbRows::new(columns, rows))
    }
}

fn coerce_keys(keys: &[KeyValue], pk: &PrimaryKey) -> Vec<rusqlite::types::Value> {
    keys.iter()
        .zip(pk.columns())
        .map(|(key, col)| to_sql_value(key.clone().coerce(col.field_type)))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use similar_asserts::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        source::DmlStatement,
        writer::{DmlApplier, LdbWriter},
    };

    fn seeded_ldb(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("ldb.db");
        let mut writer = LdbWriter::open(&path).unwrap();
        let mut seq = 0;
        let mut apply = |sql: &str| {
            seq += 1;
            writer
                .apply(&DmlStatement {
                    sequence: seq,
                    timestamp: Utc::now(),
                    family_name: "foo".to_string(),
                    table_name: "bar".to_string(),
                    statement: sql.to_string(),
                })
                .unwrap();
        };
        apply("CREATE TABLE foo___bar (key VARCHAR PRIMARY KEY, val TEXT)");
        apply("INSERT INTO foo___bar VALUES ('zzz', 'yyy')");
        apply("INSERT INTO foo___bar VALUES ('aaa', 'bbb')");
        apply(
            "CREATE TABLE foo___multi (
                a INTEGER,
                b VARCHAR(10),
                val TEXT,
                PRIMARY KEY (a, b)
             )",
        );
        apply("INSERT INTO foo___multi VALUES (1, 'x', 'one-x')");
        apply("INSERT INTO foo___multi VALUES (1, 'y', 'one-y')");
        apply("INSERT INTO foo___multi VALUES (2, 'x', 'two-x')");
        apply("CREATE TABLE foo___bin (key VARBINARY PRIMARY KEY, val TEXT)");
        apply("INSERT INTO foo___bin VALUES (x'7a7a7a', 'bin-val')");
        apply("CREATE TABLE foo___nopk (val TEXT)");
        path
    }

    #[test]
    fn gets_a_row_by_full_key() {
        let dir = tempdir().unwrap();
        let reader = LdbReader::open(&seeded_ldb(dir.path())).unwrap();

        let row: Option<HashMap<String, LdbValue>> = reader
            .get_row_by_key("foo", "bar", &[KeyValue::from("zzz")])
            .unwrap();
        let row = row.unwrap();
        assert_eq!(row["key"], LdbValue::Text("zzz".to_string()));
        assert_eq!(row["val"], LdbValue::Text("yyy".to_string()));

        let missing: Option<HashMap<String, LdbValue>> = reader
            .get_row_by_key("foo", "bar", &[KeyValue::from("nope")])
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn gets_a_row_into_a_record_target() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct Row {
            key: String,
            val: String,
        }

        let dir = tempdir().unwrap();
        let reader = LdbReader::open(&seeded_ldb(dir.path())).unwrap();
        let row: Option<Row> = reader
            .get_row_by_key("foo", "bar", &[KeyValue::from("zzz")])
            .unwrap();
        assert_eq!(
            row,
            Some(Row {
                key: "zzz".to_string(),
                val: "yyy".to_string(),
            })
        );
    }

    #[test]
    fn string_keys_reach_binary_columns_as_bytes() {
        let dir = tempdir().unwrap();
        let reader = LdbReader::open(&seeded_ldb(dir.path())).unwrap();
        let row: Option<HashMap<String, LdbValue>> = reader
            .get_row_by_key("foo", "bin", &[KeyValue::from("zzz")])
            .unwrap();
        let row = row.unwrap();
        assert_eq!(row["key"], LdbValue::Bytes(b"zzz".to_vec()));
        assert_eq!(row["val"], LdbValue::Text("bin-val".to_string()));
    }

    #[test]
    fn wrong_key_count_errors() {
        let dir = tempdir().unwrap();
        let reader = LdbReader::open(&seeded_ldb(dir.path())).unwrap();
        let err = reader
            .get_row_by_key::<HashMap<String, LdbValue>>("foo", "multi", &[KeyValue::from(1)])
            .unwrap_err();
        assert!(matches!(err, ReaderError::NeedFullKey { expected: 2, got: 1 }));

        let err = reader
            .get_rows_by_key_prefix(
                "foo",
                "multi",
                &[KeyValue::from(1), KeyValue::from("x"), KeyValue::from(9)],
            )
            .unwrap_err();
        assert!(matches!(err, ReaderError::TooManyKeys { max: 2, got: 3 }));
    }

    #[test]
    fn unknown_table_errors() {
        let dir = tempdir().unwrap();
        let reader = LdbReader::open(&seeded_ldb(dir.path())).unwrap();
        let err = reader
            .get_row_by_key::<HashMap<String, LdbValue>>("foo", "missing", &[KeyValue::from("k")])
            .unwrap_err();
        assert!(matches!(err, ReaderError::TableNotFound { .. }));
    }

    #[test]
    fn table_without_pk_errors() {
        let dir = tempdir().unwrap();
        let reader = LdbReader::open(&seeded_ldb(dir.path())).unwrap();
        let err = reader
            .get_rows_by_key_prefix("foo", "nopk", &[])
            .unwrap_err();
        assert!(matches!(err, ReaderError::TableHasNoPrimaryKey { .. }));
    }

    #[test]
    fn prefix_query_matches_by_leading_key_columns() {
        let dir = tempdir().unwrap();
        let reader = LdbReader::open(&seeded_ldb(dir.path())).unwrap();

        let mut rows = reader
            .get_rows_by_key_prefix("foo", "multi", &[KeyValue::from(1)])
            .unwrap();
        let mut vals = Vec::new();
        while rows.advance() {
            let row: HashMap<String, LdbValue> = rows.scan().unwrap();
            vals.push(row["val"].clone());
        }
        assert_eq!(
            vals,
            vec![
                LdbValue::Text("one-x".to_string()),
                LdbValue::Text("one-y".to_string()),
            ]
        );
    }

    #[test]
    fn full_pk_prefix_equals_full_key_lookup() {
        let dir = tempdir().unwrap();
        let reader = LdbReader::open(&seeded_ldb(dir.path())).unwrap();
        let keys = [KeyValue::from(2), KeyValue::from("x")];

        let by_key: HashMap<String, LdbValue> = reader
            .get_row_by_key("foo", "multi", &keys)
            .unwrap()
            .unwrap();
        let mut rows = reader.get_rows_by_key_prefix("foo", "multi", &keys).unwrap();
        assert!(rows.advance());
        let by_prefix: HashMap<String, LdbValue> = rows.scan().unwrap();
        assert!(!rows.advance());
        assert_eq!(by_key, by_prefix);
    }

    #[test]
    fn zero_keys_scan_the_whole_table() {
        let dir = tempdir().unwrap();
        let reader = LdbReader::open(&seeded_ldb(dir.path())).unwrap();
        let mut rows = reader.get_rows_by_key_prefix("foo", "multi", &[]).unwrap();
        let mut count = 0;
        while rows.advance() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn ping_is_false_until_the_first_write() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("empty.db");
        let reader = LdbReader::open(&empty).unwrap();
        assert!(!reader.ping());

        let seeded = seeded_ldb(dir.path());
        let reader = LdbReader::open(&seeded).unwrap();
        assert!(reader.ping());
        assert_eq!(reader.get_last_sequence().unwrap(), 10);
    }

    #[test]
    fn pk_cache_invalidates_after_an_engine_error() {
        let dir = tempdir().unwrap();
        let path = seeded_ldb(dir.path());
        let reader = LdbReader::open(&path).unwrap();

        // Warm the cache.
        let _: Option<HashMap<String, LdbValue>> = reader
            .get_row_by_key("foo", "bar", &[KeyValue::from("zzz")])
            .unwrap();
        assert!(reader.inner.lock().pk_cache.contains_key("foo___bar"));

        // Drop the table behind the reader's back.
        let writer_conn = Connection::open(&path).unwrap();
        writer_conn.execute("DROP TABLE foo___bar", []).unwrap();

        let err = reader
            .get_row_by_key::<HashMap<String, LdbValue>>("foo", "bar", &[KeyValue::from("zzz")])
            .unwrap_err();
        assert!(matches!(err, ReaderError::Sqlite { .. }));
        assert!(!reader.inner.lock().pk_cache.contains_key("foo___bar"));

        // With the cache invalidated, the next call reports the truth.
        let err = reader
            .get_row_by_key::<HashMap<String, LdbValue>>("foo", "bar", &[KeyValue::from("zzz")])
            .unwrap_err();
        assert!(matches!(err, ReaderError::TableNotFound { .. }));
    }

    #[test]
    fn invalid_names_are_rejected() {
        let dir = tempdir().unwrap();
        let reader = LdbReader::open(&seeded_ldb(dir.path())).unwrap();
        let err = reader
            .get_row_by_key::<HashMap<String, LdbValue>>("Foo", "bar", &[KeyValue::from("k")])
            .unwrap_err();
        assert!(matches!(err, ReaderError::InvalidName { .. }));
    }
}
