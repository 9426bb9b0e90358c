//! The ledger-latency monitor.
//!
//! Periodically reads how far the LDB trails the ledger, publishes the
//! latency as a gauge, and (optionally) attributes a healthy/unhealthy
//! signal to the cluster scheduler so that load balancers can route away
//! from hosts with stale data.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use snafu::Snafu;
use tokio_util::sync::CancellationToken;

use crate::{
    internal_events::{HealthAttributeSet, LedgerLatencyMeasured, emit},
    ldb::{LdbError, ledger_latency, open_ldb_reader},
};

/// Default interval between latency reads.
pub const DEFAULT_LEDGER_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default latency above which this host attributes itself unhealthy.
pub const DEFAULT_MAX_HEALTHY_LATENCY: Duration = Duration::from_secs(60);

/// Name of the published cluster attribute.
pub const HEALTH_ATTRIBUTE_NAME: &str = "ctlstore-ldb-health";

/// Attribute values for the two health states.
pub const HEALTHY_VALUE: &str = "healthy";
pub const UNHEALTHY_VALUE: &str = "unhealthy";

/// Failures tolerated from the metadata service before surfacing.
const ATTRIBUTE_FAILURE_TOLERANCE: u32 = 3;

/// Error from the cluster metadata service.
#[derive(Debug, Snafu)]
#[snafu(display("failed to set cluster attribute: {message}"))]
pub struct AttributeError {
    pub message: String,
}

/// Publishes one attribute to a cluster-visible store.
///
/// Implementations talk to whatever scheduler metadata service the
/// deployment runs under; tests supply their own.
#[async_trait]
pub trait AttributeSetter: Send + Sync {
    async fn set_attribute(&self, name: &str, value: &str) -> Result<(), AttributeError>;
}

/// Ledger monitor tuning.
#[derive(Clone)]
pub struct LedgerMonitorConfig {
    pub poll_interval: Duration,
    pub max_healthy_latency: Duration,
    pub attribute_name: String,
    /// When set, health transitions are attributed through it.
    pub attribute_setter: Option<Arc<dyn AttributeSetter>>,
}

impl Default for LedgerMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_LEDGER_POLL_INTERVAL,
            max_healthy_latency: DEFAULT_MAX_HEALTHY_LATENCY,
            attribute_name: HEALTH_ATTRIBUTE_NAME.to_string(),
            attribute_setter: None,
        }
    }
}

impl std::fmt::Debug for LedgerMonitorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerMonitorConfig")
            .field("poll_interval", &self.poll_interval)
            .field("max_healthy_latency", &self.max_healthy_latency)
            .field("attribute_name", &self.attribute_name)
            .field("attribution", &self.attribute_setter.is_some())
            .finish()
    }
}

/// Runs the monitor until cancelled.
///
/// The monitor opens its own read handle on the LDB; WAL mode lets it read
/// while the shovel writes.
pub async fn run_ledger_monitor(
    ldb_path: std::path::PathBuf,
    config: LedgerMonitorConfig,
    token: CancellationToken,
) {
    let conn = match open_ldb_reader(&ldb_path) {
        Ok(conn) => conn,
        Err(error) => {
            tracing::error!(
                message = "Ledger monitor could not open the LDB.",
                path = %ldb_path.display(),
                error = %error,
            );
            return;
        }
    };

    let mut last_known_healthy: Option<bool> = None;
    let mut attribute_failures: u32 = 0;
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let latency = match ledger_latency(&conn) {
            Ok(latency) => latency,
            Err(LdbError::NoLedgerUpdates) => {
                tracing::debug!(message = "No ledger updates yet; skipping latency publish.");
                continue;
            }
            Err(error) => {
                tracing::warn!(message = "Failed to read ledger latency.", error = %error);
                continue;
            }
        };
        emit(LedgerLatencyMeasured { latency });

        let Some(setter) = config.attribute_setter.as_ref() else {
            continue;
        };
        let healthy = latency <= config.max_healthy_latency;
        if last_known_healthy == Some(healthy) {
            continue;
        }
        let value = if healthy { HEALTHY_VALUE } else { UNHEALTHY_VALUE };
        match setter.set_attribute(&config.attribute_name, value).await {
            Ok(()) => {
                attribute_failures = 0;
                last_known_healthy = Some(healthy);
                emit(HealthAttributeSet { healthy });
            }
            Err(error) => {
                // Metadata-service blips are temporary; only a run of them
                // is worth surfacing.
                attribute_failures += 1;
                if attribute_failures >= ATTRIBUTE_FAILURE_TOLERANCE {
                    tracing::error!(
                        message = "Cluster attribution keeps failing.",
                        consecutive_failures = attribute_failures,
                        error = %error,
                    );
                } else {
                    tracing::debug!(
                        message = "Cluster attribution failed; will retry.",
                        error = %error,
                    );
                }
            }
        }
    }
}
