//! DML sources.
//!
//! A DML source produces ledger entries in sequence order, one at a time,
//! strictly above a caller-provided watermark. The production implementation
//! ([`SqlDmlSource`]) polls the upstream ledger table in bounded blocks;
//! tests substitute their own implementations of [`DmlSource`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::Snafu;

mod sql;

pub use self::sql::{DEFAULT_BLOCK_SIZE, SqlDmlSource};

/// Name of the append-only ledger table in the upstream database.
pub const DML_LEDGER_TABLE: &str = "ctlstore_dml_ledger";

/// One entry of the upstream DML ledger.
///
/// Immutable once produced; consumed exactly once, in order, by the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmlStatement {
    /// Strictly increasing sequence assigned by the upstream.
    pub sequence: i64,
    /// Upstream commit timestamp of the entry.
    pub timestamp: DateTime<Utc>,
    /// Family half of the logical table the statement targets.
    pub family_name: String,
    /// Table half of the logical table the statement targets.
    pub table_name: String,
    /// The raw SQL to apply.
    pub statement: String,
}

/// Error produced by [`DmlSource::next`].
#[derive(Debug, Snafu)]
pub enum SourceError {
    /// No ledger entry above the watermark currently exists.
    ///
    /// A sentinel, not a failure: the caller sleeps and polls again.
    #[snafu(display("no new statements"))]
    NoNewStatements,

    /// A ledger row carried a timestamp no accepted layout can parse.
    #[snafu(display("unparseable ledger timestamp {value:?}"))]
    BadTimestamp { value: String },

    /// The upstream query failed.
    #[snafu(display("ledger query failed: {source}"))]
    Query { source: sqlx::Error },
}

/// Produces the next ledger entry strictly greater than the watermark.
#[async_trait]
pub trait DmlSource: Send {
    async fn next(&mut self) -> Result<DmlStatement, SourceError>;
}
