//! Embedded, durable store for hierarchical tasks with dependencies.
//!
//! Tasks live in one primary file. Every mutation goes through a segmented
//! write-ahead log first and is folded into the primary file by checkpoints. An
//! in-memory index answers status, parent, project and dependent queries, and a TTL
//! cache sits in front of point lookups.
//!
//! Start with [`TaskStore::open`].

#![warn(missing_docs)]

pub mod admin;
pub mod db;
pub mod model;
pub mod primitives;
pub mod storage;
pub mod types;
pub mod validation;

pub use db::{
    Check, CommitResult, HealthCheck, HealthStatus, MaintenanceReport, OpResult, StoreMetrics,
    TaskStore, TransactionInfo, TxState, VacuumOutcome, VerifyReport,
};
pub use model::{Metadata, NewTask, Task, TaskOp, TaskPatch, TaskStatus, TaskType};
pub use primitives::wal::SyncMode;
pub use storage::{CacheOptions, StoreOptions, TxOptions};
pub use types::{ErrorKind, ErrorReport, Result, Seq, TaskError, TxId};
