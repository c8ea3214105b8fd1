use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::primitives::io::{IoFactory, StdIoFactory};
use crate::primitives::pool::{PoolListener, PoolOptions};
use crate::primitives::retry::RetryPolicy;
use crate::primitives::wal::{SyncMode, WalOptions};
use crate::types::{Result, TaskError};
use crate::validation::{DefaultPathValidator, PathValidator};

use super::metrics::{default_metrics, StorageMetrics};

/// File extensions accepted for the primary file.
pub const ALLOWED_EXTENSIONS: [&str; 3] = ["db", "sqlite", "sqlite3"];

/// Default primary file name.
pub const DEFAULT_FILE_NAME: &str = "tasks.db";

/// Read cache tuning.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheOptions {
    /// Maximum cached tasks. Zero disables the cache.
    pub capacity: usize,
    /// TTL of an entry that was never read.
    pub base_ttl: Duration,
    /// TTL added per recorded access.
    pub ttl_extension: Duration,
    /// Upper bound for the effective TTL and for time since last write.
    pub max_ttl: Duration,
    /// Save entries to `<file>.cache` on close and reload them on open.
    pub persist: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            capacity: 1024,
            base_ttl: Duration::from_secs(300),
            ttl_extension: Duration::from_secs(30),
            max_ttl: Duration::from_secs(3600),
            persist: false,
        }
    }
}

/// Transaction limits.
#[derive(Clone, Debug, PartialEq)]
pub struct TxOptions {
    /// Operations allowed in one transaction.
    pub max_operations: usize,
    /// Pending transactions older than this are rolled back by maintenance.
    pub timeout: Duration,
    /// How long committed or rolled back transactions stay queryable.
    pub retention: Duration,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            max_operations: 256,
            timeout: Duration::from_secs(30),
            retention: Duration::from_secs(60),
        }
    }
}

/// Configuration supplied when opening a [`crate::TaskStore`].
#[derive(Clone)]
pub struct StoreOptions {
    /// Directory holding the primary file and its companions.
    pub storage_dir: PathBuf,
    /// Primary file name, `<name>.<ext>`.
    pub file_name: String,
    /// Connection pool settings.
    pub pool: PoolOptions,
    /// WAL settings.
    pub wal: WalOptions,
    /// Cache settings.
    pub cache: CacheOptions,
    /// Transaction limits.
    pub tx: TxOptions,
    /// Period of the background maintenance thread. `None` disables it.
    pub maintenance_interval: Option<Duration>,
    /// Path rules.
    pub validator: Arc<dyn PathValidator>,
    /// Metrics sink.
    pub metrics: Arc<dyn StorageMetrics>,
    /// Opens file handles; swapped out by tests to inject faults.
    pub io: Arc<dyn IoFactory>,
    /// Receives pool lifecycle events.
    pub pool_listener: Option<PoolListener>,
}

impl fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("storage_dir", &self.storage_dir)
            .field("file_name", &self.file_name)
            .field("pool", &self.pool)
            .field("wal", &self.wal)
            .field("cache", &self.cache)
            .field("tx", &self.tx)
            .field("maintenance_interval", &self.maintenance_interval)
            .finish_non_exhaustive()
    }
}

impl StoreOptions {
    /// Creates options for a store under `storage_dir` with default settings.
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            file_name: DEFAULT_FILE_NAME.to_string(),
            pool: PoolOptions::default(),
            wal: WalOptions::default(),
            cache: CacheOptions::default(),
            tx: TxOptions::default(),
            maintenance_interval: Some(Duration::from_secs(30)),
            validator: Arc::new(DefaultPathValidator::default()),
            metrics: default_metrics(),
            io: Arc::new(StdIoFactory),
            pool_listener: None,
        }
    }

    /// Sets the primary file name.
    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    /// Replaces the pool settings.
    pub fn pool(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the pool bounds.
    pub fn pool_size(mut self, min: usize, max: usize) -> Self {
        self.pool.min_size = min;
        self.pool.max_size = max;
        self
    }

    /// Replaces the WAL settings.
    pub fn wal(mut self, wal: WalOptions) -> Self {
        self.wal = wal;
        self
    }

    /// Sets the WAL sync mode.
    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.wal.sync_mode = mode;
        self
    }

    /// Sets the retry policy for WAL I/O.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.wal.retry = retry;
        self
    }

    /// Replaces the cache settings.
    pub fn cache(mut self, cache: CacheOptions) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the cache capacity; zero disables caching.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache.capacity = capacity;
        self
    }

    /// Enables or disables the cache side file.
    pub fn persist_cache(mut self, enabled: bool) -> Self {
        self.cache.persist = enabled;
        self
    }

    /// Replaces the transaction limits.
    pub fn tx(mut self, tx: TxOptions) -> Self {
        self.tx = tx;
        self
    }

    /// Sets the maintenance period; `None` disables the background thread.
    pub fn maintenance_interval(mut self, interval: Option<Duration>) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Sets the path validator.
    pub fn validator(mut self, validator: Arc<dyn PathValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Sets the metrics sink.
    pub fn metrics(mut self, metrics: Arc<dyn StorageMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sets the file handle factory.
    pub fn io_factory(mut self, io: Arc<dyn IoFactory>) -> Self {
        self.io = io;
        self
    }

    /// Registers a pool event listener.
    pub fn pool_listener(mut self, listener: PoolListener) -> Self {
        self.pool_listener = Some(listener);
        self
    }

    /// Full path of the primary file.
    pub fn primary_path(&self) -> PathBuf {
        self.storage_dir.join(&self.file_name)
    }

    /// Path of the cache side file.
    pub fn cache_path(&self) -> PathBuf {
        cache_path_for(&self.primary_path())
    }

    /// Rejects inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        validate_file_name(&self.file_name)?;
        self.pool.validate()?;
        if self.cache.base_ttl > self.cache.max_ttl {
            return Err(TaskError::Config(format!(
                "cache base_ttl {:?} exceeds max_ttl {:?}",
                self.cache.base_ttl, self.cache.max_ttl
            )));
        }
        if self.tx.max_operations == 0 {
            return Err(TaskError::Config("tx max_operations must be at least 1".into()));
        }
        if self.wal.segment_max_bytes < 1024 {
            return Err(TaskError::Config(
                "wal segment_max_bytes must be at least 1024".into(),
            ));
        }
        if self.wal.retry.multiplier < 1.0 {
            return Err(TaskError::Config("retry multiplier must be >= 1.0".into()));
        }
        if self.maintenance_interval.is_some_and(|d| d.is_zero()) {
            return Err(TaskError::Config("maintenance interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// `<primary>.cache`
pub(crate) fn cache_path_for(primary: &Path) -> PathBuf {
    let mut name = primary.as_os_str().to_owned();
    name.push(".cache");
    PathBuf::from(name)
}

fn validate_file_name(name: &str) -> Result<()> {
    if name.contains('/') || name.contains('\\') {
        return Err(TaskError::Config(format!(
            "file name '{name}' must not contain path separators"
        )));
    }
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return Err(TaskError::Config(format!(
            "file name '{name}' needs one of the extensions {ALLOWED_EXTENSIONS:?}"
        )));
    };
    if stem.is_empty() {
        return Err(TaskError::Config(format!("file name '{name}' has an empty stem")));
    }
    if !ALLOWED_EXTENSIONS.contains(&ext) {
        return Err(TaskError::Config(format!(
            "extension '{ext}' is not one of {ALLOWED_EXTENSIONS:?}"
        )));
    }
    Ok(())
}
