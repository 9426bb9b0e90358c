//! The WAL monitor.
//!
//! The embedded engine appends every committed transaction to the LDB's
//! write-ahead log; checkpoints fold the WAL back into the main file. Left
//! alone, a busy writer with long-lived readers can grow the WAL without
//! bound. This monitor runs two loops under one cancellation scope:
//!
//! - the size loop stats the WAL file and publishes its size;
//! - the checkpoint loop triggers `writer.checkpoint(mode)` whenever the
//!   WAL crosses the configured threshold, and publishes the result.
//!
//! Each loop disables itself after a run of consecutive failures rather
//! than spamming a broken filesystem or engine forever.

use std::{path::PathBuf, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    internal_events::{MonitorLoopDisabled, WalCheckpointed, WalSizeMeasured, emit},
    ldb::wal_path,
    writer::{CheckpointMode, LdbWriter},
};

/// Default interval for both WAL loops.
pub const DEFAULT_WAL_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default WAL size that triggers a checkpoint.
pub const DEFAULT_CHECKPOINT_THRESHOLD: u64 = 64 * 1024 * 1024;

/// Consecutive failures after which a loop stops.
pub const DEFAULT_CONSECUTIVE_MAX_ERRORS: u32 = 5;

/// WAL monitor tuning.
#[derive(Debug, Clone)]
pub struct WalMonitorConfig {
    pub poll_interval: Duration,
    pub checkpoint_threshold_bytes: u64,
    pub checkpoint_mode: CheckpointMode,
    pub consecutive_max_errors: u32,
}

impl Default for WalMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_WAL_POLL_INTERVAL,
            checkpoint_threshold_bytes: DEFAULT_CHECKPOINT_THRESHOLD,
            checkpoint_mode: CheckpointMode::Passive,
            consecutive_max_errors: DEFAULT_CONSECUTIVE_MAX_ERRORS,
        }
    }
}

/// Runs both WAL loops until cancelled (or self-disabled).
pub async fn run_wal_monitor(
    ldb_path: PathBuf,
    writer: Arc<Mutex<LdbWriter>>,
    config: WalMonitorConfig,
    token: CancellationToken,
) {
    let wal = wal_path(&ldb_path);
    tokio::join!(
        size_loop(wal.clone(), config.clone(), token.clone()),
        checkpoint_loop(wal, writer, config, token),
    );
}

async fn size_loop(wal: PathBuf, config: WalMonitorConfig, token: CancellationToken) {
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut consecutive_errors = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match tokio::fs::metadata(&wal).await {
            Ok(metadata) => {
                consecutive_errors = 0;
                emit(WalSizeMeasured {
                    bytes: metadata.len(),
                });
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                // No WAL yet (nothing written, or fully checkpointed with
                // truncate); that is a size of zero, not a failure.
                consecutive_errors = 0;
                emit(WalSizeMeasured { bytes: 0 });
            }
            Err(error) => {
                consecutive_errors += 1;
                tracing::warn!(
                    message = "Failed to stat the WAL file.",
                    path = %wal.display(),
                    error = %error,
                    consecutive_errors,
                );
                if consecutive_errors >= config.consecutive_max_errors {
                    emit(MonitorLoopDisabled {
                        loop_name: "wal-size",
                        consecutive_errors,
                    });
                    return;
                }
            }
        }
    }
}

async fn checkpoint_loop(
    wal: PathBuf,
    writer: Arc<Mutex<LdbWriter>>,
    config: WalMonitorConfig,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut consecutive_errors = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let size = match tokio::fs::metadata(&wal).await {
            Ok(metadata) => metadata.len(),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => 0,
            Err(error) => {
                consecutive_errors += 1;
                tracing::warn!(
                    message = "Checkpoint loop failed to stat the WAL file.",
                    path = %wal.display(),
                    error = %error,
                    consecutive_errors,
                );
                if consecutive_errors >= config.consecutive_max_errors {
                    emit(MonitorLoopDisabled {
                        loop_name: "wal-checkpoint",
                        consecutive_errors,
                    });
                    return;
                }
                continue;
            }
        };
        if size <= config.checkpoint_threshold_bytes {
            consecutive_errors = 0;
            continue;
        }
        let result = writer.lock().checkpoint(config.checkpoint_mode);
        match result {
            Ok(result) => {
                consecutive_errors = 0;
                emit(WalCheckpointed {
                    busy: result.busy,
                    log_pages: result.log_pages,
                    checkpointed_pages: result.checkpointed_pages,
                    uncommitted_pages: result.uncommitted_pages(),
                });
            }
            Err(error) => {
                consecutive_errors += 1;
                tracing::warn!(
                    message = "WAL checkpoint failed.",
                    error = %error,
                    consecutive_errors,
                );
                if consecutive_errors >= config.consecutive_max_errors {
                    emit(MonitorLoopDisabled {
                        loop_name: "wal-checkpoint",
                        consecutive_errors,
                    });
                    return;
                }
            }
        }
    }
}
