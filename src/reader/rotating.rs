//! The rotating reader.
//!
//! Distributes read load across N LDB replicas on a minute-accurate
//! schedule. For a rotation period of P minutes, the minute-of-hour picks
//! the active replica as `(minute / P) % N`, producing a deterministic
//! length-60 schedule. With the constraint `N <= 60 / P`, every replica
//! gets at least one full period per hour.
//!
//! The active index is a lock-free atomic; cursors handed to callers stay
//! valid across rotations because they own their result set.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{Timelike, Utc};
use serde::de::DeserializeOwned;
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

use super::{LdbReader, LdbRows, ReaderError, RowReader};
use crate::{
    internal_events::{ReaderRotated, emit},
    ldb::LDB_FILENAME,
    schema::KeyValue,
};

/// Accepted rotation periods, in minutes.
pub const ROTATION_PERIODS: &[u32] = &[6, 10, 15, 20, 30];

/// Default interval between schedule checks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Error raised when building a rotating reader.
#[derive(Debug, Snafu)]
pub enum RotationError {
    /// Rotation needs at least two replicas to be worth anything.
    #[snafu(display("rotation requires at least 2 readers, got {got}"))]
    NotEnoughReaders { got: usize },

    /// More replicas than rotation slots in an hour.
    #[snafu(display("rotation with period {period}m supports at most {max} readers, got {got}"))]
    TooManyReaders { period: u32, max: usize, got: usize },

    /// The period does not divide the hour into the supported slots.
    #[snafu(display("invalid rotation period {got}m (accepted: 6, 10, 15, 20, 30)"))]
    InvalidPeriod { got: u32 },

    /// Opening one of the replicas failed.
    #[snafu(display("failed to open rotation replica: {source}"))]
    OpenReplica { source: ReaderError },
}

/// Computes the length-60 minute-of-hour schedule.
fn schedule(num_readers: usize, period: u32) -> Result<[usize; 60], RotationError> {
    if !ROTATION_PERIODS.contains(&period) {
        return Err(RotationError::InvalidPeriod { got: period });
    }
    if num_readers < 2 {
        return Err(RotationError::NotEnoughReaders { got: num_readers });
    }
    let max = (60 / period) as usize;
    if num_readers > max {
        return Err(RotationError::TooManyReaders {
            period,
            max,
            got: num_readers,
        });
    }
    let mut slots = [0usize; 60];
    for (minute, slot) in slots.iter_mut().enumerate() {
        *slot = (minute / period as usize) % num_readers;
    }
    Ok(slots)
}

/// Default replica file names under a root directory: `ldb.db`,
/// `ldb-2.db`, ..., `ldb-N.db`.
pub fn default_rotation_paths(root: &Path, num_readers: usize) -> Vec<PathBuf> {
    (1..=num_readers)
        .map(|i| {
            if i == 1 {
                root.join(LDB_FILENAME)
            } else {
                root.join(format!("ldb-{i}.db"))
            }
        })
        .collect()
}

struct Inner {
    readers: Vec<LdbReader>,
    schedule: [usize; 60],
    active: AtomicUsize,
}

impl Inner {
    fn active_reader(&self) -> &LdbReader {
        &self.readers[self.active.load(Ordering::Acquire)]
    }

    fn rotate_to_minute(&self, minute: usize) {
        let next = self.schedule[minute % 60];
        let previous = self.active.swap(next, Ordering::AcqRel);
        if previous != next {
            emit(ReaderRotated { active_index: next });
        }
    }
}

/// Round-robins reads across several LDB replicas.
pub struct RotatingLdbReader {
    inner: Arc<Inner>,
    token: CancellationToken,
}

impl RotatingLdbReader {
    /// Opens one reader per path and starts the rotation ticker.
    pub fn open(paths: &[PathBuf], period: u32) -> Result<Self, RotationError> {
        Self::open_with_interval(paths, period, DEFAULT_TICK_INTERVAL)
    }

    /// Like [`RotatingLdbReader::open`] with a custom tick interval.
    pub fn open_with_interval(
        paths: &[PathBuf],
        period: u32,
        tick_interval: Duration,
    ) -> Result<Self, RotationError> {
        let schedule = schedule(paths.len(), period)?;
        let readers = paths
            .iter()
            .map(|path| LdbReader::open(path))
            .collect::<Result<Vec<_>, _>>()
            .context(OpenReplicaSnafu)?;
        let inner = Arc::new(Inner {
            readers,
            schedule,
            active: AtomicUsize::new(0),
        });
        inner.rotate_to_minute(Utc::now().minute() as usize);

        let token = CancellationToken::new();
        tokio::spawn(tick(Arc::clone(&inner), token.clone(), tick_interval));
        Ok(Self { inner, token })
    }

    /// The index of the replica currently serving reads.
    pub fn active_index(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn ping(&self) -> bool {
        self.inner.active_reader().ping()
    }

    pub fn get_last_sequence(&self) -> Result<i64, ReaderError> {
        self.inner.active_reader().get_last_sequence()
    }

    pub fn get_ledger_latency(&self) -> Result<Duration, ReaderError> {
        self.inner.active_reader().get_ledger_latency()
    }

    /// Stops the ticker and releases every replica reader.
    pub fn close(self) {}
}

impl Drop for RotatingLdbReader {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl RowReader for RotatingLdbReader {
    fn get_row_by_key<T: DeserializeOwned>(
        &self,
        family: &str,
        table: &str,
        keys: &[KeyValue],
    ) -> Result<Option<T>, ReaderError> {
        self.inner.active_reader().get_row_by_key(family, table, keys)
    }

    fn get_rows_by_key_prefix(
        &self,
        family: &str,
        table: &str,
        keys: &[KeyValue],
    ) -> Result<LdbRows, ReaderError> {
        self.inner
            .active_reader()
            .get_rows_by_key_prefix(family, table, keys)
    }
}

async fn tick(inner: Arc<Inner>, token: CancellationToken, tick_interval: Duration) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        inner.rotate_to_minute(Utc::now().minute() as usize);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use similar_asserts::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        reader::LdbValue,
        source::DmlStatement,
        writer::{DmlApplier, LdbWriter},
    };

    #[test]
    fn schedule_follows_minute_div_period_mod_n() {
        let slots = schedule(4, 15).unwrap();
        assert_eq!(slots[0], 0);
        assert_eq!(slots[14], 0);
        assert_eq!(slots[15], 1);
        assert_eq!(slots[30], 2);
        assert_eq!(slots[45], 3);
        assert_eq!(slots[59], 3);

        let slots = schedule(2, 6).unwrap();
        // Ten 6-minute slots alternate between the two readers.
        let expected: Vec<usize> = (0..60).map(|m| (m / 6) % 2).collect();
        assert_eq!(slots.to_vec(), expected);
    }

    #[test]
    fn rejects_bad_configurations() {
        assert!(matches!(
            schedule(1, 15),
            Err(RotationError::NotEnoughReaders { got: 1 })
        ));
        assert!(matches!(
            schedule(5, 15),
            Err(RotationError::TooManyReaders {
                period: 15,
                max: 4,
                got: 5,
            })
        ));
        assert!(matches!(
            schedule(2, 7),
            Err(RotationError::InvalidPeriod { got: 7 })
        ));
    }

    #[test]
    fn default_paths_follow_the_replica_naming() {
        let paths = default_rotation_paths(Path::new("/var/spool/ctlstore"), 3);
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/var/spool/ctlstore/ldb.db"),
                PathBuf::from("/var/spool/ctlstore/ldb-2.db"),
                PathBuf::from("/var/spool/ctlstore/ldb-3.db"),
            ]
        );
    }

    fn seed_replica(path: &Path, marker: &str) {
        let mut writer = LdbWriter::open(path).unwrap();
        writer
            .apply(&DmlStatement {
                sequence: 1,
                timestamp: Utc::now(),
                family_name: "foo".to_string(),
                table_name: "bar".to_string(),
                statement: format!(
                    "CREATE TABLE foo___bar (key TEXT PRIMARY KEY, val TEXT); \
                     INSERT INTO foo___bar VALUES ('which', '{marker}');"
                ),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn each_replica_serves_its_own_rows() {
        let dir = tempdir().unwrap();
        let paths = default_rotation_paths(dir.path(), 4);
        for (index, path) in paths.iter().enumerate() {
            seed_replica(path, &format!("replica-{index}"));
        }

        let rotating = RotatingLdbReader::open(&paths, 15).unwrap();
        // The open-time rotation picked whatever the wall clock dictates;
        // walk every schedule slot by hand and check the reads follow.
        for (minute, expected_index) in [(0usize, 0usize), (15, 1), (30, 2), (45, 3)] {
            rotating.inner.rotate_to_minute(minute);
            assert_eq!(rotating.active_index(), expected_index);
            let row: Option<HashMap<String, LdbValue>> = rotating
                .get_row_by_key("foo", "bar", &[KeyValue::from("which")])
                .unwrap();
            assert_eq!(
                row.unwrap()["val"],
                LdbValue::Text(format!("replica-{expected_index}"))
            );
        }
    }

    #[tokio::test]
    async fn cursors_survive_rotation() {
        let dir = tempdir().unwrap();
        let paths = default_rotation_paths(dir.path(), 2);
        seed_replica(&paths[0], "replica-0");
        seed_replica(&paths[1], "replica-1");

        let rotating = RotatingLdbReader::open(&paths, 30).unwrap();
        rotating.inner.rotate_to_minute(0);
        let mut rows = rotating.get_rows_by_key_prefix("foo", "bar", &[]).unwrap();

        rotating.inner.rotate_to_minute(30);
        assert_eq!(rotating.active_index(), 1);

        // The cursor still reads from the replica it was opened against.
        assert!(rows.advance());
        let row: HashMap<String, LdbValue> = rows.scan().unwrap();
        assert_eq!(row["val"], LdbValue::Text("replica-0".to_string()));
    }
}
