//! The SQL-backed DML source.

use std::collections::VecDeque;

use async_trait::async_trait;
use sqlx::{any::AnyRow, AnyPool, Row};

use super::{DmlSource, DmlStatement, SourceError, DML_LEDGER_TABLE};
use crate::{
    internal_events::{emit, SequenceSkipped},
    ldb::parse_timestamp,
};

/// Default number of ledger rows fetched per upstream query.
pub const DEFAULT_BLOCK_SIZE: usize = 100;

/// Reads the upstream ledger table in ordered, bounded blocks.
///
/// Rows are buffered in a FIFO; each [`DmlSource::next`] call returns the
/// head. When the buffer drains, one block query runs: up to `block_size`
/// rows with `seq` above the watermark, ascending. An empty result yields
/// the [`SourceError::NoNewStatements`] sentinel.
///
/// Sequence gaps are observed here but not rejected; the shovel decides
/// what a gap means.
pub struct SqlDmlSource {
    pool: AnyPool,
    last_sequence: i64,
    block_size: usize,
    ledger_table: String,
    shards: Vec<(String, String)>,
    buffer: VecDeque<DmlStatement>,
}

impl SqlDmlSource {
    /// Creates a source that resumes strictly above `last_sequence`.
    pub fn new(pool: AnyPool, last_sequence: i64) -> Self {
        Self {
            pool,
            last_sequence,
            block_size: DEFAULT_BLOCK_SIZE,
            ledger_table: DML_LEDGER_TABLE.to_string(),
            shards: Vec::new(),
            buffer: VecDeque::new(),
        }
    }

    /// Sets the number of rows fetched per block query.
    ///
    /// Defaults to [`DEFAULT_BLOCK_SIZE`].
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Overrides the ledger table name.
    pub fn ledger_table(mut self, table: impl Into<String>) -> Self {
        self.ledger_table = table.into();
        self
    }

    /// Restricts the source to the given `(family, table)` pairs.
    ///
    /// An empty set means no filtering.
    pub fn shards(mut self, shards: Vec<(String, String)>) -> Self {
        self.shards = shards;
        self
    }

    /// The current watermark: the highest sequence this source has seen.
    pub fn last_sequence(&self) -> i64 {
        self.last_sequence
    }

    fn block_query(&self) -> String {
        // The timestamp is cast to text so every supported upstream driver
        // hands it back the same way.
        let mut query = format!(
            "SELECT seq, CAST(leader_ts AS CHAR) AS leader_ts, statement, \
             family_name, table_name FROM {} WHERE seq > ?",
            self.ledger_table
        );
        if !self.shards.is_empty() {
            let clause = self
                .shards
                .iter()
                .map(|_| "(family_name = ? AND table_name = ?)")
                .collect::<Vec<_>>()
                .join(" OR ");
            query.push_str(&format!(" AND ({clause})"));
        }
        query.push_str(" ORDER BY seq ASC LIMIT ?");
        query
    }

    fn parse_row(row: &AnyRow) -> Result<DmlStatement, SourceError> {
        let sequence: i64 = row.try_get("seq").map_err(|source| SourceError::Query { source })?;
        // The timestamp arrives as text; any value no accepted layout can
        // parse aborts the whole call.
        let raw_ts: String = row
            .try_get("leader_ts")
            .map_err(|source| SourceError::Query { source })?;
        let timestamp = parse_timestamp(&raw_ts).map_err(|_| SourceError::BadTimestamp {
            value: raw_ts.clone(),
        })?;
        Ok(DmlStatement {
            sequence,
            timestamp,
            family_name: row
                .try_get("family_name")
                .map_err(|source| SourceError::Query { source })?,
            table_name: row
                .try_get("table_name")
                .map_err(|source| SourceError::Query { source })?,
            statement: row
                .try_get("statement")
                .map_err(|source| SourceError::Query { source })?,
        })
    }

    async fn fill_buffer(&mut self) -> Result<(), SourceError> {
        let query = self.block_query();
        let mut q = sqlx::query(&query).bind(self.last_sequence);
        for (family, table) in &self.shards {
            q = q.bind(family.as_str()).bind(table.as_str());
        }
        q = q.bind(self.block_size as i64);

        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|source| SourceError::Query { source })?;

        for row in &rows {
            let statement = Self::parse_row(row)?;
            if self.last_sequence != 0 && statement.sequence > self.last_sequence + 1 {
                emit(SequenceSkipped {
                    expected: self.last_sequence + 1,
                    received: statement.sequence,
                });
            }
            self.last_sequence = statement.sequence;
            self.buffer.push_back(statement);
        }
        Ok(())
    }
}

#[async_trait]
impl DmlSource for SqlDmlSource {
    async fn next(&mut self) -> Result<DmlStatement, SourceError> {
        if self.buffer.is_empty() {
            self.fill_buffer().await?;
        }
        self.buffer.pop_front().ok_or(SourceError::NoNewStatements)
    }
}
