//! In-memory structures and on-disk image of the task table.
//!
//! The table itself lives in the store; this module holds everything derived from it
//! (index, cache), the primary file codec, configuration and metrics hooks.

/// Recency and TTL cache over task records.
pub mod cache;

/// Dependency cycle detection.
pub mod graph;

/// Path, status, parent, project and dependency lookups.
pub mod index;

mod metrics;
mod options;

/// Primary file format and the checkpoint target that rewrites it.
pub mod primary;

pub use cache::{CacheManager, CacheStats};
pub use index::TaskIndex;
pub use metrics::{default_metrics, CounterMetrics, NoopMetrics, StorageMetrics};
pub(crate) use options::cache_path_for;
pub use options::{CacheOptions, StoreOptions, TxOptions, ALLOWED_EXTENSIONS, DEFAULT_FILE_NAME};
pub use primary::{ImageCheckpoint, PrimaryImage};
