//! LDB file layout, bookkeeping tables, and handle setup.
//!
//! The LDB is a single SQLite database file per host. Beyond the replicated
//! user tables (named `family___table`), it carries two bookkeeping tables:
//!
//! - `_ldb_seq`: a one-row table holding the highest applied ledger sequence.
//! - `_ldb_last_update`: a key/value table whose `ledger` row records the
//!   timestamp of the last applied ledger entry.
//!
//! Both rows are updated inside the same transaction as every applied DML
//! statement, so a reader can always derive replication lag from a committed
//! snapshot.

use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use snafu::{ResultExt, Snafu};

/// Default root directory for all on-disk state.
pub const DEFAULT_CTLSTORE_PATH: &str = "/var/spool/ctlstore";

/// Environment variable overriding [`DEFAULT_CTLSTORE_PATH`].
pub const CTLSTORE_PATH_ENV: &str = "CTLSTORE_PATH";

/// File name of the LDB inside the root (or a versioned subdirectory).
pub const LDB_FILENAME: &str = "ldb.db";

/// Suffix the embedded engine appends to the LDB path for its write-ahead log.
pub const WAL_SUFFIX: &str = "-wal";

/// Name of the one-row table holding the highest applied sequence.
pub const SEQ_TABLE: &str = "_ldb_seq";

/// Fixed id of the single `_ldb_seq` row.
pub const SEQ_ROW_ID: i64 = 1;

/// Name of the key/value table holding last-update timestamps.
pub const LAST_UPDATE_TABLE: &str = "_ldb_last_update";

/// Key of the `_ldb_last_update` row fed by ledger applies.
pub const LEDGER_LAST_UPDATE_NAME: &str = "ledger";

/// Timestamp layouts accepted for ledger and last-update values, tried in
/// order. Values are stored using the first layout.
pub const TIMESTAMP_LAYOUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.fZ",
];

/// Error raised by LDB bookkeeping operations.
#[derive(Debug, Snafu)]
pub enum LdbError {
    /// The underlying engine call failed.
    #[snafu(display("ldb error: {source}"))]
    Sqlite { source: rusqlite::Error },

    /// A stored timestamp did not match any accepted layout.
    #[snafu(display("unparseable timestamp {value:?}"))]
    BadTimestamp { value: String },

    /// The ledger has never been applied to this LDB.
    #[snafu(display("no ledger updates have been received yet"))]
    NoLedgerUpdates,
}

/// Root directory for on-disk state, honoring `CTLSTORE_PATH`.
pub fn ctlstore_root() -> PathBuf {
    env::var_os(CTLSTORE_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CTLSTORE_PATH))
}

/// Default path of the non-versioned LDB file.
pub fn default_ldb_path() -> PathBuf {
    ctlstore_root().join(LDB_FILENAME)
}

/// Path of the write-ahead log file next to an LDB file.
pub fn wal_path(ldb_path: &Path) -> PathBuf {
    let mut name = ldb_path.as_os_str().to_os_string();
    name.push(WAL_SUFFIX);
    PathBuf::from(name)
}

/// Opens an LDB for writing, creating the file if needed.
///
/// The handle is put in WAL mode so that concurrent readers never observe a
/// partially applied transaction, with a busy timeout to ride out checkpoint
/// contention.
pub fn open_ldb_writer(path: &Path) -> Result<Connection, LdbError> {
    let conn = Connection::open(path).context(SqliteSnafu)?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context(SqliteSnafu)?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context(SqliteSnafu)?;
    conn.busy_timeout(Duration::from_secs(10)).context(SqliteSnafu)?;
    Ok(conn)
}

/// Opens an LDB for reading only.
pub fn open_ldb_reader(path: &Path) -> Result<Connection, LdbError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .context(SqliteSnafu)?;
    conn.busy_timeout(Duration::from_secs(10)).context(SqliteSnafu)?;
    Ok(conn)
}

/// Creates the bookkeeping tables and seeds the sequence row.
///
/// Idempotent; the sequence row exists (at zero) once this returns.
pub fn ensure_ldb_initialized(conn: &Connection) -> Result<(), LdbError> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {SEQ_TABLE} (
            id INTEGER PRIMARY KEY NOT NULL,
            seq INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS {LAST_UPDATE_TABLE} (
            name STRING PRIMARY KEY NOT NULL,
            timestamp DATETIME NOT NULL
         );
         INSERT OR IGNORE INTO {SEQ_TABLE} (id, seq) VALUES ({SEQ_ROW_ID}, 0);"
    ))
    .context(SqliteSnafu)
}

/// Reads the highest applied sequence, or `None` when the LDB has never been
/// initialized.
pub fn fetch_seq(conn: &Connection) -> Result<Option<i64>, LdbError> {
    let seq = conn
        .query_row(
            &format!("SELECT seq FROM {SEQ_TABLE} WHERE id = ?"),
            [SEQ_ROW_ID],
            |row| row.get(0),
        )
        .optional()
        .context(SqliteSnafu)?;
    Ok(seq)
}

/// Formats a timestamp the way bookkeeping rows store them.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_LAYOUTS[0]).to_string()
}

/// Parses a stored or ledger timestamp, trying each accepted layout.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, LdbError> {
    for layout in TIMESTAMP_LAYOUTS {
        if let Ok(parsed) = DateTime::parse_from_str(value, layout) {
            return Ok(parsed.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, layout) {
            return Ok(naive.and_utc());
        }
    }
    Err(LdbError::BadTimestamp {
        value: value.to_string(),
    })
}

/// Reads the timestamp of the last applied ledger entry.
pub fn fetch_last_ledger_update(conn: &Connection) -> Result<Option<DateTime<Utc>>, LdbError> {
    let raw: Option<String> = conn
        .query_row(
            &format!("SELECT timestamp FROM {LAST_UPDATE_TABLE} WHERE name = ?"),
            [LEDGER_LAST_UPDATE_NAME],
            |row| row.get(0),
        )
        .optional()
        .context(SqliteSnafu)?;
    raw.map(|value| parse_timestamp(&value)).transpose()
}

/// Computes how far this LDB trails the ledger.
///
/// Errors with [`LdbError::NoLedgerUpdates`] until the first apply lands.
pub fn ledger_latency(conn: &Connection) -> Result<Duration, LdbError> {
    match fetch_last_ledger_update(conn)? {
        None => Err(LdbError::NoLedgerUpdates),
        Some(last) => {
            let lag = Utc::now().signed_duration_since(last);
            Ok(lag.to_std().unwrap_or(Duration::ZERO))
        }
    }
}
