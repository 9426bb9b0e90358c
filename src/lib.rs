//! # ctlstore
//!
//! ctlstore replicates a central, authoritative relational control store (the
//! *upstream*) onto every application host as a local embedded SQL database
//! (the *LDB*), giving application code in-process, microsecond-latency,
//! always-available reads of shared configuration data. Writes go to the
//! upstream exclusively; reads always go to the LDB. The replication unit is
//! an append-only ordered DML ledger.
//!
//! ## Components
//!
//! - [`reflector::Reflector`] pulls ledger entries from the upstream and
//!   applies them to the LDB transactionally and in order. It owns bootstrap
//!   from a snapshot store, a ledger-latency monitor, and a WAL monitor.
//! - [`reader::LdbReader`] is the in-process read API: primary-key discovery
//!   with caching, statement caching, and row scanning into caller targets.
//!   [`reader::VersionedLdbReader`] and [`reader::RotatingLdbReader`] add
//!   hot-swap and round-robin semantics on top of the same capability set.
//! - [`supervisor::Supervisor`] periodically quiesces the reflector,
//!   checkpoints and vacuums the LDB, and uploads a compressed snapshot for
//!   bootstrapping new hosts.
//! - [`shovel::Shovel`] is the polling loop between a [`source::DmlSource`]
//!   and the [`writer::LdbWriter`].
//!
//! ## Data flow
//!
//! ```text
//! upstream ledger -> DmlSource -> Shovel -> LdbWriter -> LDB file
//!                                                          |
//!                          application <- LdbReader <------+
//!                                                          |
//!                 snapshot store <- Supervisor <-----------+
//! ```

#![deny(clippy::all)]

pub mod changelog;
pub mod internal_events;
pub mod jitter;
pub mod ldb;
pub mod reader;
pub mod reflector;
pub mod schema;
pub mod shovel;
pub mod source;
pub mod supervisor;
pub mod writer;

pub use self::ldb::{default_ldb_path, DEFAULT_CTLSTORE_PATH};
pub use self::reader::LdbReader;
pub use self::reflector::Reflector;
pub use self::source::DmlStatement;
