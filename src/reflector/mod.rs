//! The reflector: the per-host replication engine.
//!
//! A reflector owns one LDB and one upstream handle. Starting it drives the
//! full lifecycle:
//!
//! 1. bootstrap the LDB from a snapshot store when configured and no LDB
//!    file exists yet;
//! 2. open the LDB writer and the upstream ledger connection;
//! 3. query the highest sequence the upstream currently knows (the free
//!    pass for the initial catch-up jump);
//! 4. run the shovel, rebuilding it after every crash so the watermark is
//!    re-read from the LDB rather than trusted from memory;
//! 5. in parallel, run the ledger-latency monitor and the WAL monitor.
//!
//! The loop ends only on cancellation; shovel failures log, count, and
//! restart after a short sleep.

use std::{path::PathBuf, sync::Arc, time::Duration};

use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};
use sqlx::any::AnyPoolOptions;
use tokio_util::sync::CancellationToken;

mod bootstrap;
mod ctl;
mod ledger_monitor;
mod multi;
mod wal_monitor;

pub use self::{
    bootstrap::{
        BootstrapOutcome, DownloadError, Downloader, MAX_DOWNLOAD_ATTEMPTS, SnapshotFetcher,
        bootstrap_ldb, tmp_download_path,
    },
    ctl::{CtlError, DEFAULT_REFLECTOR_CTL_TIMEOUT, ReflectorCtl},
    ledger_monitor::{
        AttributeError, AttributeSetter, HEALTH_ATTRIBUTE_NAME, HEALTHY_VALUE,
        LedgerMonitorConfig, UNHEALTHY_VALUE, run_ledger_monitor,
    },
    multi::MultiReflector,
    wal_monitor::{WalMonitorConfig, run_wal_monitor},
};
use crate::{
    changelog::{ChangelogCallback, DEFAULT_CHANGELOG_MAX_SIZE},
    internal_events::{ReflectorRestarted, emit},
    shovel::{Shovel, ShovelConfig},
    source::{DML_LEDGER_TABLE, SqlDmlSource},
    writer::{LdbWriter, WriterCallback, WriterError},
};

/// Sleep between shovel rebuilds after a crash.
const RESTART_SLEEP: Duration = Duration::from_secs(1);

/// Error that aborts a reflector run before the shovel loop engages.
#[derive(Debug, Snafu)]
pub enum ReflectorError {
    /// Bootstrapping the LDB from the snapshot store failed.
    #[snafu(display("bootstrap failed: {source}"))]
    Bootstrap { source: DownloadError },

    /// Opening or initializing the LDB failed.
    #[snafu(display("ldb writer failed: {source}"))]
    Writer { source: WriterError },

    /// Connecting to or querying the upstream failed.
    #[snafu(display("upstream failed: {source}"))]
    Upstream { source: sqlx::Error },

    /// The LDB path has no usable parent directory.
    #[snafu(display("cannot create ldb directory {}: {source}", path.display()))]
    LdbDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Change-log output settings.
#[derive(Debug, Clone)]
pub struct ChangelogConfig {
    pub path: PathBuf,
    pub max_size: u64,
}

/// Everything a reflector needs to run.
#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    pub ldb_path: PathBuf,
    pub upstream_dsn: String,
    pub bootstrap_url: Option<String>,
    /// Treat an absent snapshot as "start fresh" instead of an error.
    pub supervisor_mode: bool,
    pub ledger_table: String,
    pub block_size: usize,
    pub shards: Vec<(String, String)>,
    pub shovel: ShovelConfig,
    pub changelog: Option<ChangelogConfig>,
    pub ledger_monitor: Option<LedgerMonitorConfig>,
    pub wal_monitor: Option<WalMonitorConfig>,
}

/// Builder for [`Reflector`].
pub struct ReflectorBuilder {
    config: ReflectorConfig,
}

impl ReflectorBuilder {
    pub fn new(ldb_path: impl Into<PathBuf>, upstream_dsn: impl Into<String>) -> Self {
        Self {
            config: ReflectorConfig {
                ldb_path: ldb_path.into(),
                upstream_dsn: upstream_dsn.into(),
                bootstrap_url: None,
                supervisor_mode: false,
                ledger_table: DML_LEDGER_TABLE.to_string(),
                block_size: crate::source::DEFAULT_BLOCK_SIZE,
                shards: Vec::new(),
                shovel: ShovelConfig::default(),
                changelog: None,
                ledger_monitor: Some(LedgerMonitorConfig::default()),
                wal_monitor: Some(WalMonitorConfig::default()),
            },
        }
    }

    /// Snapshot URL used to seed an empty LDB (`s3://`, `file://`, `data:`).
    pub fn bootstrap_url(mut self, url: impl Into<String>) -> Self {
        self.config.bootstrap_url = Some(url.into());
        self
    }

    /// In supervisor mode an absent snapshot means "start fresh".
    pub fn supervisor_mode(mut self, enabled: bool) -> Self {
        self.config.supervisor_mode = enabled;
        self
    }

    /// Number of ledger rows fetched per upstream query.
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.config.block_size = block_size;
        self
    }

    /// Restrict replication to the given `(family, table)` pairs.
    pub fn shards(mut self, shards: Vec<(String, String)>) -> Self {
        self.config.shards = shards;
        self
    }

    /// Shovel poll/skip behavior. `max_known_seq_on_startup` is overwritten
    /// at start time from the upstream.
    pub fn shovel(mut self, shovel: ShovelConfig) -> Self {
        self.config.shovel = shovel;
        self
    }

    /// Enables the change log at `path` with the default size bound.
    pub fn changelog(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.changelog = Some(ChangelogConfig {
            path: path.into(),
            max_size: DEFAULT_CHANGELOG_MAX_SIZE,
        });
        self
    }

    /// Enables the change log with an explicit size bound.
    pub fn changelog_with_max_size(mut self, path: impl Into<PathBuf>, max_size: u64) -> Self {
        self.config.changelog = Some(ChangelogConfig {
            path: path.into(),
            max_size,
        });
        self
    }

    /// Replaces the ledger-monitor settings; `None` disables the monitor.
    pub fn ledger_monitor(mut self, config: Option<LedgerMonitorConfig>) -> Self {
        self.config.ledger_monitor = config;
        self
    }

    /// Replaces the WAL-monitor settings; `None` disables the monitor.
    pub fn wal_monitor(mut self, config: Option<WalMonitorConfig>) -> Self {
        self.config.wal_monitor = config;
        self
    }

    /// Overrides the upstream ledger table name.
    pub fn ledger_table(mut self, table: impl Into<String>) -> Self {
        self.config.ledger_table = table.into();
        self
    }

    pub fn build(self) -> Reflector {
        Reflector {
            config: self.config,
        }
    }
}

/// The replication engine.
pub struct Reflector {
    config: ReflectorConfig,
}

impl Reflector {
    pub fn builder(
        ldb_path: impl Into<PathBuf>,
        upstream_dsn: impl Into<String>,
    ) -> ReflectorBuilder {
        ReflectorBuilder::new(ldb_path, upstream_dsn)
    }

    pub fn from_config(config: ReflectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReflectorConfig {
        &self.config
    }

    /// Runs until `token` is cancelled.
    ///
    /// Setup failures (bootstrap, LDB open, upstream connect) surface as
    /// errors; shovel crashes restart internally.
    pub async fn start(&self, token: CancellationToken) -> Result<(), ReflectorError> {
        let config = &self.config;

        if let Some(parent) = config.ldb_path.parent() {
            std::fs::create_dir_all(parent).context(LdbDirectorySnafu {
                path: parent.to_path_buf(),
            })?;
        }

        if let Some(url) = &config.bootstrap_url {
            bootstrap_ldb(
                &Downloader::new(),
                url,
                &config.ldb_path,
                config.supervisor_mode,
            )
            .await
            .context(BootstrapSnafu)?;
        }

        let mut writer = LdbWriter::open(&config.ldb_path).context(WriterSnafu)?;
        if let Some(changelog) = &config.changelog {
            writer.register_callback(WriterCallback::Changelog(ChangelogCallback::new(
                &changelog.path,
                changelog.max_size,
            )));
        }
        let writer = Arc::new(Mutex::new(writer));

        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(2)
            .connect(&config.upstream_dsn)
            .await
            .context(UpstreamSnafu)?;
        let max_known_seq: i64 = sqlx::query_scalar(&format!(
            "SELECT COALESCE(MAX(seq), 0) FROM {}",
            config.ledger_table
        ))
        .fetch_one(&pool)
        .await
        .context(UpstreamSnafu)?;

        let monitor_token = token.child_token();
        let mut monitors = Vec::new();
        if let Some(monitor_config) = config.ledger_monitor.clone() {
            monitors.push(tokio::spawn(run_ledger_monitor(
                config.ldb_path.clone(),
                monitor_config,
                monitor_token.clone(),
            )));
        }
        if let Some(monitor_config) = config.wal_monitor.clone() {
            monitors.push(tokio::spawn(run_wal_monitor(
                config.ldb_path.clone(),
                Arc::clone(&writer),
                monitor_config,
                monitor_token.clone(),
            )));
        }

        let result = self
            .shovel_loop(&pool, &writer, max_known_seq, &token)
            .await;

        monitor_token.cancel();
        for monitor in monitors {
            let _ = monitor.await;
        }
        pool.close().await;
        result
    }

    async fn shovel_loop(
        &self,
        pool: &sqlx::AnyPool,
        writer: &Arc<Mutex<LdbWriter>>,
        max_known_seq: i64,
        token: &CancellationToken,
    ) -> Result<(), ReflectorError> {
        let config = &self.config;
        loop {
            if token.is_cancelled() {
                return Ok(());
            }
            // Rebuild from the LDB every pass: after a crash the in-memory
            // watermark cannot be trusted.
            let last_applied = writer.lock().last_sequence().context(WriterSnafu)?;
            let source = SqlDmlSource::new(pool.clone(), last_applied)
                .block_size(config.block_size)
                .ledger_table(config.ledger_table.clone())
                .shards(config.shards.clone());
            let shovel_config = ShovelConfig {
                max_known_seq_on_startup: max_known_seq,
                ..config.shovel.clone()
            };
            let applier: crate::shovel::SharedApplier = Arc::clone(writer);
            let mut shovel = Shovel::new(Box::new(source), applier, last_applied, shovel_config);

            match shovel.start(token).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    tracing::error!(
                        message = "Shovel crashed; rebuilding.",
                        error = %error,
                    );
                    emit(ReflectorRestarted);
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(RESTART_SLEEP) => {}
                    }
                }
            }
        }
    }
}
