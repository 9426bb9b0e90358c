//! Internal telemetry events.
//!
//! Every observation this crate makes has a corresponding event struct here,
//! emitted through [`emit`] so that call sites stay free of metric-name
//! string literals.

use std::time::Duration;

use metrics::{counter, gauge};

/// An observation with a metrics side effect.
pub trait InternalEvent {
    fn emit(self);
}

/// Emits an internal event.
pub fn emit(event: impl InternalEvent) {
    event.emit();
}

pub struct StatementApplied {
    pub sequence: i64,
}

impl InternalEvent for StatementApplied {
    fn emit(self) {
        counter!("shovel_statements_applied_total").increment(1);
        gauge!("shovel_last_applied_seq").set(self.sequence as f64);
    }
}

pub struct SequenceSkipped {
    pub expected: i64,
    pub received: i64,
}

impl InternalEvent for SequenceSkipped {
    fn emit(self) {
        tracing::warn!(
            message = "Ledger sequence skipped.",
            expected = self.expected,
            received = self.received,
        );
        counter!("skipped_sequence_total").increment(1);
    }
}

pub struct ShovelPollError;

impl InternalEvent for ShovelPollError {
    fn emit(self) {
        counter!("shovel_poll_errors_total").increment(1);
    }
}

pub struct LedgerLatencyMeasured {
    pub latency: Duration,
}

impl InternalEvent for LedgerLatencyMeasured {
    fn emit(self) {
        gauge!("ledger_latency_seconds").set(self.latency.as_secs_f64());
    }
}

pub struct HealthAttributeSet {
    pub healthy: bool,
}

impl InternalEvent for HealthAttributeSet {
    fn emit(self) {
        counter!("reflector_health_transitions_total",
            "healthy" => if self.healthy { "true" } else { "false" })
        .increment(1);
    }
}

pub struct WalSizeMeasured {
    pub bytes: u64,
}

impl InternalEvent for WalSizeMeasured {
    fn emit(self) {
        gauge!("ldb_wal_size_bytes").set(self.bytes as f64);
    }
}

pub struct WalCheckpointed {
    pub busy: i64,
    pub log_pages: i64,
    pub checkpointed_pages: i64,
    pub uncommitted_pages: i64,
}

impl InternalEvent for WalCheckpointed {
    fn emit(self) {
        counter!("ldb_wal_checkpoints_total").increment(1);
        gauge!("ldb_wal_checkpoint_busy").set(self.busy as f64);
        gauge!("ldb_wal_log_pages").set(self.log_pages as f64);
        gauge!("ldb_wal_checkpointed_pages").set(self.checkpointed_pages as f64);
        gauge!("ldb_wal_uncommitted_pages").set(self.uncommitted_pages as f64);
    }
}

pub struct MonitorLoopDisabled {
    pub loop_name: &'static str,
    pub consecutive_errors: u32,
}

impl InternalEvent for MonitorLoopDisabled {
    fn emit(self) {
        tracing::error!(
            message = "Monitor loop disabled after consecutive failures.",
            loop_name = self.loop_name,
            consecutive_errors = self.consecutive_errors,
        );
        counter!("monitor_loops_disabled_total", "loop" => self.loop_name).increment(1);
    }
}

pub struct SnapshotUploaded {
    pub destination: String,
    pub bytes: u64,
}

impl InternalEvent for SnapshotUploaded {
    fn emit(self) {
        tracing::info!(
            message = "Snapshot uploaded.",
            destination = %self.destination,
            bytes = self.bytes,
        );
        counter!("snapshots_uploaded_total").increment(1);
        gauge!("snapshot_size_bytes").set(self.bytes as f64);
    }
}

pub struct SnapshotError;

impl InternalEvent for SnapshotError {
    fn emit(self) {
        counter!("snapshot_errors_total").increment(1);
    }
}

pub struct ReaderRotated {
    pub active_index: usize,
}

impl InternalEvent for ReaderRotated {
    fn emit(self) {
        counter!("reader_rotations_total").increment(1);
        gauge!("reader_active_index").set(self.active_index as f64);
    }
}

pub struct FullTableScan {
    pub ldb_table: String,
}

impl InternalEvent for FullTableScan {
    fn emit(self) {
        tracing::debug!(
            message = "Prefix query with no keys scans the full table.",
            table = %self.ldb_table,
        );
        counter!("reader_full_table_scans_total").increment(1);
    }
}

pub struct LdbSwapped {
    pub timestamp: i64,
}

impl InternalEvent for LdbSwapped {
    fn emit(self) {
        counter!("ldb_swaps_total").increment(1);
        gauge!("ldb_active_timestamp").set(self.timestamp as f64);
    }
}

pub struct BootstrapAttemptFailed {
    pub attempt: u32,
    pub temporary: bool,
}

impl InternalEvent for BootstrapAttemptFailed {
    fn emit(self) {
        counter!("bootstrap_attempt_failures_total",
            "temporary" => if self.temporary { "true" } else { "false" })
        .increment(1);
    }
}

pub struct ReflectorRestarted;

impl InternalEvent for ReflectorRestarted {
    fn emit(self) {
        counter!("reflector_restarts_total").increment(1);
    }
}

pub struct ChangelogEntryWritten {
    pub sequence: i64,
}

impl InternalEvent for ChangelogEntryWritten {
    fn emit(self) {
        counter!("changelog_entries_total").increment(1);
        gauge!("changelog_last_seq").set(self.sequence as f64);
    }
}

pub struct ChangelogRotated {
    pub dropped_bytes: u64,
}

impl InternalEvent for ChangelogRotated {
    fn emit(self) {
        counter!("changelog_rotations_total").increment(1);
        counter!("changelog_dropped_bytes_total").increment(self.dropped_bytes);
    }
}
