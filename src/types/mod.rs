//! Shared identifiers and the crate-wide error type.

use std::collections::BTreeMap;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod checksum;

pub use checksum::{crc32_of, frame_crc32};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TaskError>;

/// Monotonic WAL sequence number.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Seq(pub u64);

impl Seq {
    /// Returns the following sequence number.
    pub fn next(self) -> Seq {
        Seq(self.0 + 1)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier.
pub type TxId = u64;

/// Errors surfaced by the task store.
///
/// Validation and domain errors are never retried. Transient I/O is retried inside the
/// WAL manager and only escalates to [`TaskError::System`] once retries run out.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Input violates a shape or constraint rule.
    #[error("validation failed for {path} during {operation}: {constraint}")]
    Validation {
        /// Path the operation targeted.
        path: String,
        /// Operation that was rejected.
        operation: &'static str,
        /// Human readable constraint that failed.
        constraint: String,
    },
    /// Referenced task does not exist.
    #[error("task {path} not found")]
    NotFound {
        /// Missing path.
        path: String,
    },
    /// Adding the requested dependency edges would form a cycle.
    #[error("dependency cycle for {path}: {}", cycle.join(" -> "))]
    DependencyCycle {
        /// Path whose dependencies were being set.
        path: String,
        /// Cycle in traversal order, first element repeated at the end.
        cycle: Vec<String>,
    },
    /// Requested status change is not permitted.
    #[error("task {path} cannot move from {from} to {to}: {reason}")]
    StatusTransition {
        /// Task path.
        path: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
        /// Why the move was refused.
        reason: String,
    },
    /// No connection became available within the acquire timeout.
    #[error("connection pool exhausted after {waited_ms}ms (max {max_size})")]
    PoolExhausted {
        /// Milliseconds spent waiting.
        waited_ms: u64,
        /// Configured pool ceiling.
        max_size: usize,
    },
    /// A new physical connection could not be opened in time.
    #[error("connection open timed out after {waited_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds spent trying.
        waited_ms: u64,
    },
    /// Retryable I/O failure.
    #[error("transient I/O error during {operation}: {source}")]
    TransientIo {
        /// Operation that failed.
        operation: &'static str,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Retries were exhausted or an internal invariant failed.
    #[error("system error: {0}")]
    System(String),
    /// On-disk data failed validation; writes to the affected log are halted.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// Operation is not valid in the current transaction state.
    #[error("transaction {tx_id} is {state}, expected pending")]
    InvalidState {
        /// Transaction id.
        tx_id: TxId,
        /// Current state.
        state: String,
    },
    /// A configured limit was hit.
    #[error("{what} limit of {limit} exceeded")]
    LimitExceeded {
        /// Limited quantity.
        what: &'static str,
        /// Configured limit.
        limit: usize,
    },
    /// Invalid store configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Non-retryable I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Encoding or decoding a record failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of [`TaskError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`TaskError::Validation`].
    Validation,
    /// See [`TaskError::NotFound`].
    NotFound,
    /// See [`TaskError::DependencyCycle`].
    DependencyCycle,
    /// See [`TaskError::StatusTransition`].
    StatusTransition,
    /// See [`TaskError::PoolExhausted`].
    PoolExhausted,
    /// See [`TaskError::ConnectionTimeout`].
    ConnectionTimeout,
    /// See [`TaskError::TransientIo`].
    TransientIo,
    /// See [`TaskError::System`].
    System,
    /// See [`TaskError::Corruption`].
    Corruption,
    /// See [`TaskError::InvalidState`].
    InvalidState,
    /// See [`TaskError::LimitExceeded`].
    LimitExceeded,
    /// See [`TaskError::Config`].
    Config,
    /// See [`TaskError::Io`].
    Io,
    /// See [`TaskError::Serialization`].
    Serialization,
}

/// Structured error payload handed to callers of the store.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorReport {
    /// Error classification.
    pub kind: ErrorKind,
    /// Display message.
    pub message: String,
    /// Context such as path, operation or limit.
    pub metadata: BTreeMap<String, String>,
}

impl TaskError {
    pub(crate) fn validation(
        path: impl Into<String>,
        operation: &'static str,
        constraint: impl Into<String>,
    ) -> Self {
        TaskError::Validation {
            path: path.into(),
            operation,
            constraint: constraint.into(),
        }
    }

    pub(crate) fn not_found(path: impl Into<String>) -> Self {
        TaskError::NotFound { path: path.into() }
    }

    /// Returns the error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Validation { .. } => ErrorKind::Validation,
            TaskError::NotFound { .. } => ErrorKind::NotFound,
            TaskError::DependencyCycle { .. } => ErrorKind::DependencyCycle,
            TaskError::StatusTransition { .. } => ErrorKind::StatusTransition,
            TaskError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            TaskError::ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            TaskError::TransientIo { .. } => ErrorKind::TransientIo,
            TaskError::System(_) => ErrorKind::System,
            TaskError::Corruption(_) => ErrorKind::Corruption,
            TaskError::InvalidState { .. } => ErrorKind::InvalidState,
            TaskError::LimitExceeded { .. } => ErrorKind::LimitExceeded,
            TaskError::Config(_) => ErrorKind::Config,
            TaskError::Io(_) => ErrorKind::Io,
            TaskError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// True for resource-pressure errors a caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskError::PoolExhausted { .. } | TaskError::ConnectionTimeout { .. }
        )
    }

    /// Builds the structured report for this error.
    pub fn report(&self) -> ErrorReport {
        let mut metadata = BTreeMap::new();
        match self {
            TaskError::Validation {
                path,
                operation,
                constraint,
            } => {
                metadata.insert("path".into(), path.clone());
                metadata.insert("operation".into(), (*operation).into());
                metadata.insert("constraint".into(), constraint.clone());
            }
            TaskError::NotFound { path } => {
                metadata.insert("path".into(), path.clone());
            }
            TaskError::DependencyCycle { path, cycle } => {
                metadata.insert("path".into(), path.clone());
                metadata.insert("cycle".into(), cycle.join(" -> "));
            }
            TaskError::StatusTransition { path, from, to, .. } => {
                metadata.insert("path".into(), path.clone());
                metadata.insert("from".into(), from.clone());
                metadata.insert("to".into(), to.clone());
            }
            TaskError::PoolExhausted {
                waited_ms,
                max_size,
            } => {
                metadata.insert("waited_ms".into(), waited_ms.to_string());
                metadata.insert("max_size".into(), max_size.to_string());
            }
            TaskError::ConnectionTimeout { waited_ms } => {
                metadata.insert("waited_ms".into(), waited_ms.to_string());
            }
            TaskError::TransientIo { operation, .. } => {
                metadata.insert("operation".into(), (*operation).into());
            }
            TaskError::InvalidState { tx_id, state } => {
                metadata.insert("tx_id".into(), tx_id.to_string());
                metadata.insert("state".into(), state.clone());
            }
            TaskError::LimitExceeded { what, limit } => {
                metadata.insert("limit".into(), limit.to_string());
                metadata.insert("what".into(), (*what).into());
            }
            TaskError::System(_)
            | TaskError::Corruption(_)
            | TaskError::Config(_)
            | TaskError::Io(_)
            | TaskError::Serialization(_) => {}
        }
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            metadata,
        }
    }
}

pub(crate) fn clone_error(err: &TaskError) -> TaskError {
    match err {
        TaskError::Io(io_err) => TaskError::Io(io::Error::new(io_err.kind(), io_err.to_string())),
        TaskError::TransientIo { operation, source } => TaskError::TransientIo {
            operation: *operation,
            source: io::Error::new(source.kind(), source.to_string()),
        },
        TaskError::Serialization(err) => TaskError::System(format!("serialization: {err}")),
        other => TaskError::System(other.to_string()),
    }
}
