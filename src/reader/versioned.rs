//! The versioned (hot-swapping) reader.
//!
//! A versioned LDB directory contains one subdirectory per snapshot, named
//! with a zero-padded 13-digit millisecond timestamp, each holding one
//! `ldb.db` file:
//!
//! ```text
//! <ctlstore-path>/1500000000000/ldb.db
//! <ctlstore-path>/1500000000001/ldb.db
//! ```
//!
//! The reader always serves the LDB with the highest timestamp observed so
//! far. A watcher re-scans the directory every second; on discovering a
//! strictly greater timestamp it opens the new LDB, swaps it in under the
//! reader's write lock, and closes the old handle together with its cached
//! statements. Lower timestamps are ignored, so the reader never regresses.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use super::{LdbReader, LdbRows, ReaderError, RowReader};
use crate::{
    internal_events::{emit, LdbSwapped},
    ldb::{open_ldb_reader, LDB_FILENAME},
    schema::KeyValue,
};

/// Default interval between directory scans.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(1);

const TIMESTAMP_DIR_LEN: usize = 13;

/// Serves the newest LDB out of a versioned directory.
pub struct VersionedLdbReader {
    reader: Arc<LdbReader>,
    current: Arc<AtomicI64>,
    token: CancellationToken,
}

impl VersionedLdbReader {
    /// Opens the newest LDB under `dir` and starts the watcher.
    ///
    /// Fails with [`ReaderError::NoLdbFound`] when no timestamped
    /// subdirectory with an LDB file exists yet.
    pub fn open(dir: &Path) -> Result<Self, ReaderError> {
        Self::open_with_interval(dir, DEFAULT_WATCH_INTERVAL)
    }

    /// Like [`VersionedLdbReader::open`] with a custom scan interval.
    pub fn open_with_interval(dir: &Path, interval: Duration) -> Result<Self, ReaderError> {
        let (timestamp, path) = latest_ldb(dir).ok_or_else(|| ReaderError::NoLdbFound {
            path: dir.display().to_string(),
        })?;
        let reader = Arc::new(LdbReader::open(&path)?);
        let current = Arc::new(AtomicI64::new(timestamp));
        let token = CancellationToken::new();

        tokio::spawn(watch(
            dir.to_path_buf(),
            Arc::clone(&reader),
            Arc::clone(&current),
            token.clone(),
            interval,
        ));

        Ok(Self {
            reader,
            current,
            token,
        })
    }

    /// The timestamp of the LDB currently being served.
    pub fn current_timestamp(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn ping(&self) -> bool {
        self.reader.ping()
    }

    pub fn get_last_sequence(&self) -> Result<i64, ReaderError> {
        self.reader.get_last_sequence()
    }

    pub fn get_ledger_latency(&self) -> Result<Duration, ReaderError> {
        self.reader.get_ledger_latency()
    }

    /// Stops the watcher and releases the reader.
    pub fn close(self) {}
}

impl Drop for VersionedLdbReader {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl RowReader for VersionedLdbReader {
    fn get_row_by_key<T: DeserializeOwned>(
        &self,
        family: &str,
        table: &str,
        keys: &[KeyValue],
    ) -> Result<Option<T>, ReaderError> {
        self.reader.get_row_by_key(family, table, keys)
    }

    fn get_rows_by_key_prefix(
        &self,
        family: &str,
        table: &str,
        keys: &[KeyValue],
    ) -> Result<LdbRows, ReaderError> {
        self.reader.get_rows_by_key_prefix(family, table, keys)
    }
}

async fn watch(
    dir: PathBuf,
    reader: Arc<LdbReader>,
    current: Arc<AtomicI64>,
    token: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some((timestamp, path)) = latest_ldb(&dir) else {
            continue;
        };
        if timestamp <= current.load(Ordering::Acquire) {
            continue;
        }
        match open_ldb_reader(&path) {
            Ok(conn) => {
                reader.swap_connection(conn);
                current.store(timestamp, Ordering::Release);
                emit(LdbSwapped { timestamp });
                tracing::info!(
                    message = "Swapped to a newer ldb.",
                    timestamp,
                    path = %path.display(),
                );
            }
            Err(error) => {
                // Likely a partially materialized snapshot; retry next scan.
                tracing::warn!(
                    message = "Failed to open a newer ldb.",
                    path = %path.display(),
                    error = %error,
                );
            }
        }
    }
}

/// Finds the highest-timestamp subdirectory that contains an LDB file.
fn latest_ldb(dir: &Path) -> Option<(i64, PathBuf)> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut best: Option<(i64, PathBuf)> = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.len() != TIMESTAMP_DIR_LEN || !name.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let Ok(timestamp) = name.parse::<i64>() else {
            continue;
        };
        let candidate = entry.path().join(LDB_FILENAME);
        if !candidate.is_file() {
            continue;
        }
        if best.as_ref().is_none_or(|(ts, _)| timestamp > *ts) {
            best = Some((timestamp, candidate));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::ldb::{ensure_ldb_initialized, open_ldb_writer};

    fn add_version(root: &Path, timestamp: &str, seq: i64) {
        let dir = root.join(timestamp);
        std::fs::create_dir_all(&dir).unwrap();
        let conn = open_ldb_writer(&dir.join(LDB_FILENAME)).unwrap();
        ensure_ldb_initialized(&conn).unwrap();
        conn.execute("UPDATE _ldb_seq SET seq = ? WHERE id = 1", [seq])
            .unwrap();
    }

    #[test]
    fn latest_ldb_picks_the_max_timestamp() {
        let dir = tempdir().unwrap();
        add_version(dir.path(), "1500000000000", 1);
        add_version(dir.path(), "1400000000000", 2);
        // Not 13 digits; ignored.
        std::fs::create_dir_all(dir.path().join("9999")).unwrap();
        // 13 digits but no ldb file inside; ignored.
        std::fs::create_dir_all(dir.path().join("1600000000000")).unwrap();

        let (timestamp, path) = latest_ldb(dir.path()).unwrap();
        assert_eq!(timestamp, 1_500_000_000_000);
        assert!(path.ends_with("1500000000000/ldb.db"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn swaps_to_newer_versions_and_ignores_older_ones() {
        let dir = tempdir().unwrap();
        add_version(dir.path(), "1500000000000", 100);

        let reader =
            VersionedLdbReader::open_with_interval(dir.path(), Duration::from_millis(25)).unwrap();
        assert_eq!(reader.current_timestamp(), 1_500_000_000_000);
        assert_eq!(reader.get_last_sequence().unwrap(), 100);

        add_version(dir.path(), "1500000000001", 200);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(reader.current_timestamp(), 1_500_000_000_001);
        assert_eq!(reader.get_last_sequence().unwrap(), 200);

        add_version(dir.path(), "1400000000000", 300);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(reader.current_timestamp(), 1_500_000_000_001);
        assert_eq!(reader.get_last_sequence().unwrap(), 200);
    }

    #[tokio::test]
    async fn open_fails_without_any_version() {
        let dir = tempdir().unwrap();
        let result = VersionedLdbReader::open(dir.path());
        assert!(matches!(result, Err(ReaderError::NoLdbFound { .. })));
    }
}
