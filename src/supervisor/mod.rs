//! The supervisor: periodic LDB snapshots for bootstrap.
//!
//! A host running the supervisor is the fleet's snapshot producer. On every
//! cycle it quiesces the reflector, folds the WAL into the main file,
//! vacuums, uploads the resulting file to every configured destination in
//! parallel, and restarts replication. New hosts bootstrap from the latest
//! uploaded snapshot instead of replaying the whole ledger.
//!
//! An optional pre-flight guard skips the cycle when the LDB is already
//! trailing the ledger badly: snapshotting a stale LDB would hand every
//! bootstrapping host the same lag.

use std::{path::PathBuf, sync::Arc, time::Duration};

use futures::future::join_all;
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

mod snapshot;

pub use self::snapshot::{CHECKSUM_METADATA_KEY, SnapshotError, SnapshotUploader};
use crate::{
    internal_events::{SnapshotError as SnapshotErrorEvent, emit},
    ldb::{LdbError, ledger_latency, open_ldb_reader, open_ldb_writer},
    reflector::{CtlError, DEFAULT_REFLECTOR_CTL_TIMEOUT, ReflectorCtl},
    writer::{CheckpointMode, WriterError, checkpoint},
};

/// Default wait between snapshot cycles.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default shorter wait after a failed cycle.
pub const DEFAULT_BREATHE_DURATION: Duration = Duration::from_secs(30);

/// Error that fails one snapshot cycle.
#[derive(Debug, Snafu)]
pub enum SupervisorError {
    /// The reflector did not stop (or start) in time.
    #[snafu(display("reflector control failed: {source}"))]
    Ctl { source: CtlError },

    /// Checkpoint/vacuum/quiesce on the LDB failed.
    #[snafu(display("failed to quiesce the ldb: {source}"))]
    Quiesce { source: WriterError },

    /// Opening the LDB for quiescing failed.
    #[snafu(display("failed to open the ldb: {source}"))]
    OpenLdb { source: LdbError },

    /// At least one destination upload failed.
    #[snafu(display("snapshot upload failed: {source}"))]
    Upload { source: SnapshotError },
}

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub ldb_path: PathBuf,
    /// Destination URLs, uploaded in parallel each cycle.
    pub snapshot_urls: Vec<String>,
    pub snapshot_interval: Duration,
    pub breathe_duration: Duration,
    pub reflector_ctl_timeout: Duration,
    /// When set, skip the cycle if ledger latency exceeds this (or cannot
    /// be read).
    pub max_ledger_latency: Option<Duration>,
}

impl SupervisorConfig {
    pub fn new(ldb_path: impl Into<PathBuf>, snapshot_urls: Vec<String>) -> Self {
        Self {
            ldb_path: ldb_path.into(),
            snapshot_urls,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            breathe_duration: DEFAULT_BREATHE_DURATION,
            reflector_ctl_timeout: DEFAULT_REFLECTOR_CTL_TIMEOUT,
            max_ledger_latency: None,
        }
    }
}

/// Drives periodic snapshots of one LDB.
pub struct Supervisor {
    config: SupervisorConfig,
    ctl: ReflectorCtl,
    uploader: Arc<SnapshotUploader>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, ctl: ReflectorCtl) -> Self {
        Self {
            config,
            ctl,
            uploader: Arc::new(SnapshotUploader::new()),
        }
    }

    /// Runs snapshot cycles until cancelled.
    pub async fn start(&self, token: CancellationToken) {
        let mut wait = self.config.snapshot_interval;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            if self.should_skip_cycle() {
                wait = self.config.snapshot_interval;
                continue;
            }

            match self.snapshot_cycle().await {
                Ok(()) => {
                    wait = self.config.snapshot_interval;
                }
                Err(error) => {
                    tracing::error!(message = "Snapshot cycle failed.", error = %error);
                    emit(SnapshotErrorEvent);
                    wait = self.config.breathe_duration;
                }
            }
        }
    }

    /// The pre-flight ledger-latency guard.
    fn should_skip_cycle(&self) -> bool {
        let Some(max_latency) = self.config.max_ledger_latency else {
            return false;
        };
        let latency =
            open_ldb_reader(&self.config.ldb_path).and_then(|conn| ledger_latency(&conn));
        match latency {
            Ok(latency) if latency <= max_latency => false,
            Ok(latency) => {
                tracing::warn!(
                    message = "Skipping snapshot cycle; ldb is trailing the ledger.",
                    latency_secs = latency.as_secs_f64(),
                );
                true
            }
            Err(error) => {
                tracing::warn!(
                    message = "Skipping snapshot cycle; cannot read ledger latency.",
                    error = %error,
                );
                true
            }
        }
    }

    /// One full cycle: stop → quiesce → upload → restart.
    async fn snapshot_cycle(&self) -> Result<(), SupervisorError> {
        self.ctl
            .stop(self.config.reflector_ctl_timeout)
            .await
            .context(CtlSnafu)?;

        let quiesce_result = quiesce_ldb(self.config.ldb_path.clone()).await;
        let upload_result = match quiesce_result {
            Ok(()) => self.upload_all().await,
            Err(error) => Err(error),
        };

        // Replication resumes no matter how the uploads went.
        let restart_result = self
            .ctl
            .start(self.config.reflector_ctl_timeout)
            .await
            .context(CtlSnafu);

        upload_result?;
        restart_result
    }

    async fn upload_all(&self) -> Result<(), SupervisorError> {
        let uploads = self.config.snapshot_urls.iter().map(|url| {
            let uploader = Arc::clone(&self.uploader);
            let ldb_path = self.config.ldb_path.clone();
            let url = url.clone();
            async move { uploader.upload(&ldb_path, &url).await }
        });
        for result in join_all(uploads).await {
            result.context(UploadSnafu)?;
        }
        Ok(())
    }
}

/// Checkpoints, vacuums, and quiesces the LDB so the file on disk is a
/// complete point-in-time snapshot.
async fn quiesce_ldb(ldb_path: PathBuf) -> Result<(), SupervisorError> {
    tokio::task::spawn_blocking(move || -> Result<(), SupervisorError> {
        let conn = open_ldb_writer(&ldb_path).context(OpenLdbSnafu)?;
        checkpoint(&conn, CheckpointMode::Passive).context(QuiesceSnafu)?;
        conn.execute("VACUUM", [])
            .map_err(|source| WriterError::Sqlite { source })
            .context(QuiesceSnafu)?;
        // A write transaction proves no writer is mid-flight and pins the
        // file as point-in-time consistent.
        conn.execute_batch("BEGIN IMMEDIATE; COMMIT;")
            .map_err(|source| WriterError::Sqlite { source })
            .context(QuiesceSnafu)?;
        Ok(())
    })
    .await
    .expect("quiesce task panicked")
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn quiesce_leaves_a_self_contained_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ldb.db");
        {
            let conn = open_ldb_writer(&path).unwrap();
            crate::ldb::ensure_ldb_initialized(&conn).unwrap();
            conn.execute("UPDATE _ldb_seq SET seq = 100 WHERE id = 1", [])
                .unwrap();
        }
        quiesce_ldb(path.clone()).await.unwrap();

        // Copying just the main file yields a readable database.
        let copy = dir.path().join("copy.db");
        std::fs::copy(&path, &copy).unwrap();
        let conn = rusqlite::Connection::open(&copy).unwrap();
        let seq: i64 = conn
            .query_row("SELECT seq FROM _ldb_seq WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(seq, 100);
    }
}
