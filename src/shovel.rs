//! The shovel: the loop that moves ledger entries into the LDB.
//!
//! One shovel runs per reflector. It polls its DML source, applies whatever
//! comes back in order, watches for sequence skips, and sleeps a jittered
//! interval whenever the ledger has nothing new. Apply failures and
//! (optionally) sequence skips are fatal; the reflector responds by
//! rebuilding the shovel so the watermark is re-read from the LDB.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use snafu::Snafu;
use tokio_util::sync::CancellationToken;

use crate::{
    internal_events::{emit, SequenceSkipped, ShovelPollError, StatementApplied},
    jitter::jitter,
    source::{DmlSource, SourceError},
    writer::{DmlApplier, WriterError},
};

/// Default sleep between polls when the ledger is idle.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default deadline for one source poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default jitter coefficient applied to the poll interval.
pub const DEFAULT_POLL_JITTER: f64 = 0.1;

/// Error that ends a shovel run.
#[derive(Debug, Snafu)]
pub enum ShovelError {
    /// The source produced a sequence beyond the next expected one.
    ///
    /// Only raised when the shovel is configured to abort on skips; the
    /// upstream appender guarantees density, so a gap means lost writes.
    #[snafu(display(
        "skipped sequence: expected {expected} but received {received}"
    ))]
    SkippedSequence { expected: i64, received: i64 },

    /// Applying a statement to the LDB failed.
    #[snafu(display("failed to apply ledger sequence {sequence}: {source}"))]
    Apply {
        sequence: i64,
        source: WriterError,
    },

    /// The source failed with something other than the idle sentinel.
    #[snafu(display("dml source failed: {source}"))]
    Source { source: SourceError },
}

/// Shovel tuning knobs.
#[derive(Debug, Clone)]
pub struct ShovelConfig {
    /// Sleep between polls when no new entries exist.
    pub poll_interval: Duration,
    /// Deadline for a single source poll.
    pub poll_timeout: Duration,
    /// Jitter coefficient for the poll sleep, in `[0, 1]`.
    pub poll_jitter: f64,
    /// Whether a sequence skip ends the run with
    /// [`ShovelError::SkippedSequence`].
    pub abort_on_seq_skip: bool,
    /// Highest upstream sequence known when the reflector started.
    ///
    /// Jumps that land at or below this value are the expected initial
    /// catch-up from a bootstrap snapshot and are never treated as skips.
    pub max_known_seq_on_startup: i64,
}

impl Default for ShovelConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            poll_jitter: DEFAULT_POLL_JITTER,
            abort_on_seq_skip: false,
            max_known_seq_on_startup: 0,
        }
    }
}

/// A shared handle to the applier, so monitors can reach the same writer.
pub type SharedApplier = Arc<Mutex<dyn DmlApplier>>;

/// The poll/apply loop.
pub struct Shovel {
    source: Box<dyn DmlSource>,
    applier: SharedApplier,
    config: ShovelConfig,
    last_applied: i64,
}

impl Shovel {
    /// Builds a shovel resuming from `last_applied` (the LDB's current
    /// sequence; zero for a fresh LDB).
    pub fn new(
        source: Box<dyn DmlSource>,
        applier: SharedApplier,
        last_applied: i64,
        config: ShovelConfig,
    ) -> Self {
        Self {
            source,
            applier,
            config,
            last_applied,
        }
    }

    /// Runs until cancellation or a fatal error.
    ///
    /// Cancellation is a success: the loop returns `Ok(())` without
    /// finishing the current sleep or poll.
    pub async fn start(&mut self, token: &CancellationToken) -> Result<(), ShovelError> {
        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            let polled = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                polled = tokio::time::timeout(self.config.poll_timeout, self.source.next()) => polled,
            };

            let statement = match polled {
                // Poll deadline and "nothing new" both mean: idle, retry.
                Err(_elapsed) => {
                    self.idle_sleep(token).await;
                    continue;
                }
                Ok(Err(SourceError::NoNewStatements)) => {
                    self.idle_sleep(token).await;
                    continue;
                }
                Ok(Err(source)) => {
                    emit(ShovelPollError);
                    return Err(ShovelError::Source { source });
                }
                Ok(Ok(statement)) => statement,
            };

            if self.last_applied != 0
                && statement.sequence > self.last_applied + 1
                && statement.sequence > self.config.max_known_seq_on_startup
            {
                emit(SequenceSkipped {
                    expected: self.last_applied + 1,
                    received: statement.sequence,
                });
                if self.config.abort_on_seq_skip {
                    return Err(ShovelError::SkippedSequence {
                        expected: self.last_applied + 1,
                        received: statement.sequence,
                    });
                }
            }

            self.applier
                .lock()
                .apply(&statement)
                .map_err(|source| ShovelError::Apply {
                    sequence: statement.sequence,
                    source,
                })?;
            emit(StatementApplied {
                sequence: statement.sequence,
            });
            self.last_applied = statement.sequence;
        }
    }

    async fn idle_sleep(&self, token: &CancellationToken) {
        let sleep = jitter(self.config.poll_interval, self.config.poll_jitter);
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(sleep) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use chrono::Utc;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::source::DmlStatement;

    fn statement(sequence: i64) -> DmlStatement {
        DmlStatement {
            sequence,
            timestamp: Utc::now(),
            family_name: "foo".to_string(),
            table_name: "bar".to_string(),
            statement: format!("-- {sequence}"),
        }
    }

    struct VecSource {
        entries: VecDeque<DmlStatement>,
    }

    #[async_trait]
    impl DmlSource for VecSource {
        async fn next(&mut self) -> Result<DmlStatement, SourceError> {
            self.entries.pop_front().ok_or(SourceError::NoNewStatements)
        }
    }

    #[derive(Default)]
    struct RecordingApplier {
        applied: Vec<i64>,
        fail_on: Option<i64>,
    }

    impl DmlApplier for RecordingApplier {
        fn apply(&mut self, statement: &DmlStatement) -> Result<(), WriterError> {
            if self.fail_on == Some(statement.sequence) {
                return Err(WriterError::NotUserTable {
                    table: "boom".to_string(),
                });
            }
            self.applied.push(statement.sequence);
            Ok(())
        }
    }

    fn shovel_parts(
        sequences: Vec<i64>,
        last_applied: i64,
        config: ShovelConfig,
    ) -> (Shovel, Arc<Mutex<RecordingApplier>>) {
        let source = VecSource {
            entries: sequences.into_iter().map(statement).collect(),
        };
        let applier = Arc::new(Mutex::new(RecordingApplier::default()));
        let shared: SharedApplier = Arc::clone(&applier);
        let shovel = Shovel::new(Box::new(source), shared, last_applied, config);
        (shovel, applier)
    }

    #[tokio::test(start_paused = true)]
    async fn applies_entries_in_order_then_idles_until_cancelled() {
        let (mut shovel, applier) = shovel_parts(vec![1, 2, 3], 0, ShovelConfig::default());
        let token = CancellationToken::new();
        let canceller = token.clone();
        let run = tokio::spawn(async move { shovel.start(&canceller).await });

        // Let the shovel drain the source and hit the idle sleep a few times.
        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(applier.lock().applied, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn skip_aborts_when_configured() {
        let config = ShovelConfig {
            abort_on_seq_skip: true,
            max_known_seq_on_startup: 10,
            ..ShovelConfig::default()
        };
        let (mut shovel, applier) = shovel_parts(vec![12], 10, config);
        let token = CancellationToken::new();

        let err = shovel.start(&token).await.unwrap_err();
        assert!(matches!(
            err,
            ShovelError::SkippedSequence {
                expected: 11,
                received: 12,
            }
        ));
        assert!(applier.lock().applied.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn startup_jump_within_max_known_seq_is_not_a_skip() {
        let config = ShovelConfig {
            abort_on_seq_skip: true,
            max_known_seq_on_startup: 50,
            ..ShovelConfig::default()
        };
        let (mut shovel, applier) = shovel_parts(vec![42], 10, config);
        let token = CancellationToken::new();
        let inner = token.clone();
        let run = tokio::spawn(async move { shovel.start(&inner).await });

        tokio::time::sleep(Duration::from_secs(3)).await;
        token.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(applier.lock().applied, vec![42]);
    }

    #[tokio::test]
    async fn apply_failure_is_fatal_and_carries_the_sequence() {
        let (mut shovel, applier) = shovel_parts(vec![1, 2], 0, ShovelConfig::default());
        applier.lock().fail_on = Some(2);
        let token = CancellationToken::new();

        let err = shovel.start(&token).await.unwrap_err();
        assert!(matches!(err, ShovelError::Apply { sequence: 2, .. }));
        assert_eq!(applier.lock().applied, vec![1]);
    }
}
