use std::path::Path;

use crate::primitives::wal::SyncMode;
use crate::storage::{StoreOptions, DEFAULT_FILE_NAME};

/// Common options used when opening a store for administrative commands.
#[derive(Clone, Debug)]
pub struct AdminOpenOptions {
    /// Primary file name inside the storage directory.
    pub file_name: String,
    /// Whether to create the store if the primary file doesn't exist.
    pub create_if_missing: bool,
    /// Durability of WAL appends.
    pub sync_mode: SyncMode,
    /// Read cache capacity. Zero disables the cache.
    pub cache_capacity: usize,
    /// Upper bound on pooled connections.
    pub pool_max_size: usize,
}

impl Default for AdminOpenOptions {
    fn default() -> Self {
        Self {
            file_name: DEFAULT_FILE_NAME.to_string(),
            create_if_missing: false,
            sync_mode: SyncMode::Full,
            cache_capacity: 1024,
            pool_max_size: 4,
        }
    }
}

impl AdminOpenOptions {
    /// Store options for `dir`. Admin runs never start the maintenance thread.
    pub fn store_options(&self, dir: &Path) -> StoreOptions {
        let min = self.pool_max_size.min(1);
        StoreOptions::new(dir)
            .file_name(self.file_name.clone())
            .sync_mode(self.sync_mode)
            .cache_capacity(self.cache_capacity)
            .pool_size(min, self.pool_max_size)
            .maintenance_interval(None)
    }
}
