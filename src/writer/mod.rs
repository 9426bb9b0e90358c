//! The LDB writer.
//!
//! Applies one DML ledger entry to the LDB at a time, atomically: the
//! statement itself, the sequence row, and the last-update timestamp all
//! commit in a single transaction, or none of them do. Registered callbacks
//! observe every applied statement post-commit, in apply order, together
//! with the row changes the statement produced.

use std::path::Path;

use rusqlite::Connection;
use snafu::{ResultExt, Snafu};

mod changes;

pub use self::changes::{
    ChangeBuffer, ChangeKeyColumn, ChangeKind, KeyedChange, RowChange, SchemaCache,
};
use crate::{
    changelog::ChangelogCallback,
    ldb::{
        ensure_ldb_initialized, fetch_seq, format_timestamp, open_ldb_writer, LdbError,
        LAST_UPDATE_TABLE, LEDGER_LAST_UPDATE_NAME, SEQ_ROW_ID, SEQ_TABLE,
    },
    source::DmlStatement,
};

/// Error raised while applying statements or checkpointing.
#[derive(Debug, Snafu)]
pub enum WriterError {
    /// The underlying engine call failed.
    #[snafu(display("ldb writer error: {source}"))]
    Sqlite { source: rusqlite::Error },

    /// LDB bookkeeping failed.
    #[snafu(display("ldb writer error: {source}"))]
    Ldb { source: LdbError },

    /// A change was captured on a table that is not a replicated user table.
    #[snafu(display("{table:?} is not a family___table user table"))]
    NotUserTable { table: String },
}

/// WAL checkpoint flavors, mirroring the engine's checkpoint modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    Passive,
    Full,
    Restart,
    Truncate,
}

impl CheckpointMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passive => "PASSIVE",
            Self::Full => "FULL",
            Self::Restart => "RESTART",
            Self::Truncate => "TRUNCATE",
        }
    }
}

/// Result of a WAL checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalCheckpointResult {
    /// 1 when the checkpoint could not run to completion because a reader
    /// or writer held the database busy.
    pub busy: i64,
    /// Total pages in the WAL.
    pub log_pages: i64,
    /// Pages successfully moved back into the main database file.
    pub checkpointed_pages: i64,
}

impl WalCheckpointResult {
    /// Pages still waiting in the WAL after the checkpoint.
    pub fn uncommitted_pages(&self) -> i64 {
        (self.log_pages - self.checkpointed_pages).max(0)
    }
}

/// A post-commit observer of applied statements.
///
/// The changelog callback serializes changes to the on-disk change log; the
/// user callback is arbitrary.
pub enum WriterCallback {
    Changelog(ChangelogCallback),
    User(Box<dyn FnMut(&DmlStatement, &[KeyedChange]) + Send>),
}

impl WriterCallback {
    fn invoke(&mut self, statement: &DmlStatement, changes: &[KeyedChange]) {
        match self {
            Self::Changelog(changelog) => changelog.on_apply(statement, changes),
            Self::User(callback) => callback(statement, changes),
        }
    }
}

/// Applies one DML statement to the LDB.
///
/// Object-safe seam between the shovel and the writer; tests substitute
/// their own appliers.
pub trait DmlApplier: Send {
    fn apply(&mut self, statement: &DmlStatement) -> Result<(), WriterError>;
}

/// The production LDB writer.
pub struct LdbWriter {
    conn: Connection,
    buffer: ChangeBuffer,
    schema_cache: SchemaCache,
    callbacks: Vec<WriterCallback>,
}

impl LdbWriter {
    /// Opens (and initializes, if needed) the LDB at `path`.
    pub fn open(path: &Path) -> Result<Self, WriterError> {
        let conn = open_ldb_writer(path).context(LdbSnafu)?;
        Self::from_connection(conn)
    }

    /// Wraps an already-open writer connection.
    pub fn from_connection(conn: Connection) -> Result<Self, WriterError> {
        ensure_ldb_initialized(&conn).context(LdbSnafu)?;
        let buffer = ChangeBuffer::new();
        buffer.install(&conn);
        Ok(Self {
            conn,
            buffer,
            schema_cache: SchemaCache::new(),
            callbacks: Vec::new(),
        })
    }

    /// Registers a post-commit callback. Callbacks run in registration
    /// order, once per applied statement.
    pub fn register_callback(&mut self, callback: WriterCallback) {
        self.callbacks.push(callback);
    }

    /// The highest applied sequence recorded in the LDB.
    pub fn last_sequence(&self) -> Result<i64, WriterError> {
        Ok(fetch_seq(&self.conn).context(LdbSnafu)?.unwrap_or(0))
    }

    /// Runs a WAL checkpoint in the given mode.
    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<WalCheckpointResult, WriterError> {
        checkpoint(&self.conn, mode)
    }

    fn apply_in_tx(&mut self, statement: &DmlStatement) -> Result<(), WriterError> {
        let tx = self.conn.transaction().context(SqliteSnafu)?;
        tx.execute_batch(&statement.statement).context(SqliteSnafu)?;
        tx.execute(
            &format!("INSERT OR REPLACE INTO {SEQ_TABLE} (id, seq) VALUES (?, ?)"),
            rusqlite::params![SEQ_ROW_ID, statement.sequence],
        )
        .context(SqliteSnafu)?;
        tx.execute(
            &format!("INSERT OR REPLACE INTO {LAST_UPDATE_TABLE} (name, timestamp) VALUES (?, ?)"),
            rusqlite::params![
                LEDGER_LAST_UPDATE_NAME,
                format_timestamp(statement.timestamp)
            ],
        )
        .context(SqliteSnafu)?;
        tx.commit().context(SqliteSnafu)
    }
}

/// Runs a WAL checkpoint against any LDB connection.
pub fn checkpoint(
    conn: &Connection,
    mode: CheckpointMode,
) -> Result<WalCheckpointResult, WriterError> {
    conn.query_row(
        &format!("PRAGMA wal_checkpoint({})", mode.as_str()),
        [],
        |row| {
            Ok(WalCheckpointResult {
                busy: row.get(0)?,
                log_pages: row.get(1)?,
                checkpointed_pages: row.get(2)?,
            })
        },
    )
    .context(SqliteSnafu)
}

fn is_dml(statement: &str) -> bool {
    let head = statement
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(head.as_str(), "INSERT" | "UPDATE" | "DELETE" | "REPLACE")
}

impl DmlApplier for LdbWriter {
    fn apply(&mut self, statement: &DmlStatement) -> Result<(), WriterError> {
        self.buffer.clear();
        if let Err(err) = self.apply_in_tx(statement) {
            // The transaction handle rolled back on drop; drop anything the
            // hook captured before the failure as well.
            self.buffer.clear();
            return Err(err);
        }

        let raw = self.buffer.take();
        if !is_dml(&statement.statement) {
            // DDL may have reshaped the table; resolve against fresh schema.
            let target = format!("{}___{}", statement.family_name, statement.table_name);
            self.schema_cache.invalidate(&target);
        }
        let mut resolved = Vec::with_capacity(raw.len());
        for change in &raw {
            match self.schema_cache.resolve(&self.conn, change) {
                Ok(keyed) => resolved.push(keyed),
                Err(err) => tracing::warn!(
                    message = "Failed to resolve key columns for a captured change.",
                    table = %change.table,
                    error = %err,
                ),
            }
        }
        for callback in &mut self.callbacks {
            callback.invoke(statement, &resolved);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::Utc;
    use similar_asserts::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::ldb::fetch_last_ledger_update;

    fn statement(sequence: i64, sql: &str) -> DmlStatement {
        DmlStatement {
            sequence,
            timestamp: Utc::now(),
            family_name: "foo".to_string(),
            table_name: "bar".to_string(),
            statement: sql.to_string(),
        }
    }

    #[test]
    fn apply_commits_statement_seq_and_last_update_together() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ldb.db");
        let mut writer = LdbWriter::open(&path).unwrap();

        writer
            .apply(&statement(
                1,
                "CREATE TABLE foo___bar (key TEXT PRIMARY KEY, val TEXT)",
            ))
            .unwrap();
        writer
            .apply(&statement(2, "INSERT INTO foo___bar VALUES ('zzz', 'yyy')"))
            .unwrap();

        assert_eq!(writer.last_sequence().unwrap(), 2);
        assert!(fetch_last_ledger_update(&writer.conn).unwrap().is_some());
        let val: String = writer
            .conn
            .query_row("SELECT val FROM foo___bar WHERE key = 'zzz'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(val, "yyy");
    }

    #[test]
    fn failed_apply_leaves_the_ldb_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ldb.db");
        let mut writer = LdbWriter::open(&path).unwrap();
        writer
            .apply(&statement(5, "CREATE TABLE foo___bar (key TEXT PRIMARY KEY)"))
            .unwrap();

        let err = writer.apply(&statement(6, "INSERT INTO missing___table VALUES (1)"));
        assert!(err.is_err());
        assert_eq!(writer.last_sequence().unwrap(), 5);
    }

    #[test]
    fn callbacks_observe_applied_statements_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ldb.db");
        let mut writer = LdbWriter::open(&path).unwrap();

        let seen: Arc<Mutex<Vec<(i64, usize)>>> = Arc::default();
        let seen_cb = Arc::clone(&seen);
        writer.register_callback(WriterCallback::User(Box::new(
            move |statement, changes| {
                seen_cb
                    .lock()
                    .unwrap()
                    .push((statement.sequence, changes.len()));
            },
        )));

        writer
            .apply(&statement(
                1,
                "CREATE TABLE foo___bar (key TEXT PRIMARY KEY, val TEXT)",
            ))
            .unwrap();
        writer
            .apply(&statement(
                2,
                "INSERT INTO foo___bar VALUES ('a', '1'); \
                 INSERT INTO foo___bar VALUES ('b', '2');",
            ))
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(1, 0), (2, 2)]);
    }

    #[test]
    fn checkpoint_reports_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ldb.db");
        let mut writer = LdbWriter::open(&path).unwrap();
        writer
            .apply(&statement(1, "CREATE TABLE foo___bar (key TEXT PRIMARY KEY)"))
            .unwrap();

        let result = writer.checkpoint(CheckpointMode::Passive).unwrap();
        assert_eq!(result.busy, 0);
        assert!(result.uncommitted_pages() >= 0);
    }
}
