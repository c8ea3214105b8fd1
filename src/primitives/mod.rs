//! Low-level primitives the task store is built from.
//!
//! Includes positioned file I/O, retry with backoff, the segmented write-ahead log
//! and the connection pool over the primary file.

/// I/O abstractions and utilities.
///
/// Positioned reads and writes, pluggable file factories and atomic file replacement.
pub mod io;

/// Connection pool over the primary file.
pub mod pool;

/// Bounded exponential backoff for transient failures.
pub mod retry;

/// Write-ahead logging (WAL) for crash recovery.
///
/// Ensures durability through sequential logging of task mutations.
pub mod wal;
