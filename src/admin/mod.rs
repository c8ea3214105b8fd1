#![forbid(unsafe_code)]

//! Store administration and maintenance utilities.
//!
//! Each function opens the store in a directory, runs one job and closes it again,
//! returning a serialisable report. The `taskvault` binary is a thin shell over these.

mod checkpoint;
mod error;
mod options;
mod stats;
mod util;
mod vacuum;
mod verify;

/// Folds the write-ahead log into the primary file.
pub use checkpoint::{checkpoint, CheckpointReport};

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Configuration options for opening a store in admin mode.
pub use options::AdminOpenOptions;

/// Statistics collection and reporting.
pub use stats::{stats, FilesystemStats, StatsReport, WalStatsSection};

/// Checkpoint plus cleanup of caches, transactions, connections and temp files.
pub use vacuum::{vacuum, VacuumReport};

/// Integrity verification.
pub use verify::{verify, VerifyCounts, VerifyFinding, VerifyReport, VerifySeverity};

pub use util::open_store;
