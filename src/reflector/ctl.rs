//! The reflector control handle.
//!
//! The supervisor needs to quiesce the reflector around snapshots without
//! owning it. [`ReflectorCtl`] parks the reflector behind a command channel:
//! `start` and `stop` are requests with bounded waits, serviced by a manager
//! task that owns the running state. Stopping waits for the current run to
//! fully unwind, so the LDB writer handle is closed before the caller
//! proceeds.

use std::{sync::Arc, time::Duration};

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{Reflector, ReflectorError};

/// Default bounded wait for control requests.
pub const DEFAULT_REFLECTOR_CTL_TIMEOUT: Duration = Duration::from_secs(5);

/// Error raised by control requests.
#[derive(Debug, Snafu)]
pub enum CtlError {
    /// The reflector did not acknowledge within the bounded wait.
    #[snafu(display("reflector did not respond within {waited:?}"))]
    Timeout { waited: Duration },

    /// The manager task is gone; the handle is dead.
    #[snafu(display("reflector control channel closed"))]
    Closed,
}

enum Command {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

/// Starts and stops a reflector with bounded waits.
#[derive(Clone)]
pub struct ReflectorCtl {
    commands: mpsc::Sender<Command>,
}

impl ReflectorCtl {
    /// Takes ownership of `reflector` and spawns the manager task.
    pub fn new(reflector: Reflector) -> Self {
        let (commands, rx) = mpsc::channel(4);
        tokio::spawn(manage(reflector, rx));
        Self { commands }
    }

    /// Ensures the reflector is running. Idempotent.
    pub async fn start(&self, timeout: Duration) -> Result<(), CtlError> {
        self.request(Command::Start, timeout).await
    }

    /// Stops the reflector and waits for the run to unwind.
    ///
    /// A timeout leaves the stop request in flight; the manager still
    /// finishes it, but the caller should treat the cycle as failed.
    pub async fn stop(&self, timeout: Duration) -> Result<(), CtlError> {
        self.request(Command::Stop, timeout).await
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<()>) -> Command,
        timeout: Duration,
    ) -> Result<(), CtlError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(make(ack_tx))
            .await
            .map_err(|_| CtlError::Closed)?;
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CtlError::Closed),
            Err(_) => Err(CtlError::Timeout { waited: timeout }),
        }
    }
}

async fn manage(reflector: Reflector, mut commands: mpsc::Receiver<Command>) {
    let reflector = Arc::new(reflector);
    let mut running: Option<(CancellationToken, tokio::task::JoinHandle<()>)> = None;

    while let Some(command) = commands.recv().await {
        match command {
            Command::Start(ack) => {
                let stale = running
                    .as_ref()
                    .is_none_or(|(_, handle)| handle.is_finished());
                if stale {
                    let token = CancellationToken::new();
                    let run_token = token.clone();
                    let run_reflector = Arc::clone(&reflector);
                    let handle = tokio::spawn(async move {
                        if let Err(error) = run_reflector.start(run_token).await {
                            tracing::error!(
                                message = "Reflector run failed.",
                                error = %error,
                            );
                        }
                    });
                    running = Some((token, handle));
                }
                let _ = ack.send(());
            }
            Command::Stop(ack) => {
                if let Some((token, handle)) = running.take() {
                    token.cancel();
                    let _ = handle.await;
                }
                let _ = ack.send(());
            }
        }
    }

    // Handle dropped: unwind whatever is still running.
    if let Some((token, handle)) = running.take() {
        token.cancel();
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::reflector::ReflectorBuilder;

    async fn upstream_with_ledger(path: &std::path::Path) -> String {
        let dsn = format!("sqlite://{}?mode=rwc", path.display());
        sqlx::any::install_default_drivers();
        let pool = sqlx::AnyPool::connect(&dsn).await.unwrap();
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ctlstore_dml_ledger (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                leader_ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                statement TEXT NOT NULL,
                family_name TEXT NOT NULL,
                table_name TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool.close().await;
        dsn
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_and_stop_round_trip() {
        let dir = tempdir().unwrap();
        let dsn = upstream_with_ledger(&dir.path().join("upstream.db")).await;
        let reflector = ReflectorBuilder::new(dir.path().join("ldb.db"), dsn)
            .ledger_monitor(None)
            .wal_monitor(None)
            .build();

        let ctl = ReflectorCtl::new(reflector);
        ctl.start(Duration::from_secs(5)).await.unwrap();
        // Starting again while running is a no-op.
        ctl.start(Duration::from_secs(5)).await.unwrap();
        ctl.stop(Duration::from_secs(5)).await.unwrap();
        // Stopping a stopped reflector is fine too.
        ctl.stop(Duration::from_secs(5)).await.unwrap();
        // And it can come back.
        ctl.start(Duration::from_secs(5)).await.unwrap();
        ctl.stop(Duration::from_secs(5)).await.unwrap();
    }
}
