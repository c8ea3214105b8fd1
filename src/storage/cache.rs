//! Bounded task cache with recency eviction and access-extended TTL.

use std::fs;
use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::Task;
use crate::primitives::io::atomic_replace;
use crate::types::Result;

use super::options::CacheOptions;

const SIDE_FILE_VERSION: u32 = 1;

struct CacheEntry {
    task: Task,
    written_at: Instant,
    accessed_at: Instant,
    access_count: u64,
}

/// Cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that fell through.
    pub misses: u64,
    /// Entries dropped to stay within capacity.
    pub evictions: u64,
    /// Entries dropped because their TTL ran out.
    pub expirations: u64,
    /// Entries currently cached.
    pub entries: usize,
}

impl CacheStats {
    /// Fraction of lookups that hit, 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct CacheInner {
    entries: Option<LruCache<String, CacheEntry>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

#[derive(Serialize, Deserialize)]
struct SideFile {
    version: u32,
    entries: Vec<SideEntry>,
}

#[derive(Serialize, Deserialize)]
struct SideEntry {
    task: Task,
    access_count: u64,
}

/// Read-through cache in front of the task table.
pub struct CacheManager {
    options: CacheOptions,
    inner: Mutex<CacheInner>,
}

impl CacheManager {
    /// Creates an empty cache. A capacity of zero disables it.
    pub fn new(options: CacheOptions) -> Self {
        let entries = NonZeroUsize::new(options.capacity).map(LruCache::new);
        Self {
            options,
            inner: Mutex::new(CacheInner {
                entries,
                ..CacheInner::default()
            }),
        }
    }

    /// True when the cache holds anything at all.
    pub fn enabled(&self) -> bool {
        self.options.capacity > 0
    }

    /// Effective TTL for an entry read `access_count` times.
    pub fn effective_ttl(&self, access_count: u64) -> Duration {
        let extension = self
            .options
            .ttl_extension
            .saturating_mul(access_count.min(u64::from(u32::MAX)) as u32);
        self.options
            .base_ttl
            .saturating_add(extension)
            .min(self.options.max_ttl)
    }

    /// Returns the cached task and records the access, or `None` on a miss.
    pub fn get(&self, path: &str) -> Option<Task> {
        self.get_at(path, Instant::now())
    }

    pub(crate) fn get_at(&self, path: &str, now: Instant) -> Option<Task> {
        let mut inner = self.inner.lock();
        let expired = inner
            .entries
            .as_ref()
            .and_then(|lru| lru.peek(path))
            .map(|entry| self.is_expired(entry, now));
        let Some(expired) = expired else {
            inner.misses += 1;
            return None;
        };
        if expired {
            if let Some(lru) = inner.entries.as_mut() {
                lru.pop(path);
            }
            inner.expirations += 1;
            inner.misses += 1;
            return None;
        }
        let task = inner.entries.as_mut().and_then(|lru| lru.get_mut(path)).map(|entry| {
            entry.accessed_at = now;
            entry.access_count += 1;
            entry.task.clone()
        });
        inner.hits += 1;
        task
    }

    /// Inserts or replaces the entry for `task.path`, keeping its access history.
    pub fn set(&self, task: Task) {
        self.set_at(task, Instant::now());
    }

    pub(crate) fn set_at(&self, task: Task, now: Instant) {
        let mut inner = self.inner.lock();
        let Some(lru) = inner.entries.as_mut() else {
            return;
        };
        if let Some(entry) = lru.get_mut(&task.path) {
            entry.task = task;
            entry.written_at = now;
            return;
        }
        let key = task.path.clone();
        let evicted = lru.push(
            key.clone(),
            CacheEntry {
                task,
                written_at: now,
                accessed_at: now,
                access_count: 0,
            },
        );
        if let Some((evicted_key, _)) = evicted {
            if evicted_key != key {
                inner.evictions += 1;
            }
        }
    }

    /// Drops the entry for `path`. Returns whether one existed.
    pub fn delete(&self, path: &str) -> bool {
        let mut inner = self.inner.lock();
        inner
            .entries
            .as_mut()
            .and_then(|lru| lru.pop(path))
            .is_some()
    }

    /// Drops every entry. Counters are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        if let Some(lru) = inner.entries.as_mut() {
            lru.clear();
        }
        debug!("cache.clear");
    }

    /// Removes expired entries. Returns how many were dropped.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub(crate) fn cleanup_at(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let Some(lru) = inner.entries.as_mut() else {
            return 0;
        };
        let expired: Vec<String> = lru
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &expired {
            lru.pop(path);
        }
        inner.expirations += expired.len() as u64;
        if !expired.is_empty() {
            debug!(expired = expired.len(), "cache.cleanup");
        }
        expired.len()
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            entries: inner.entries.as_ref().map_or(0, |lru| lru.len()),
        }
    }

    /// Writes live entries to `path`, least recent first so a reload restores order.
    pub fn persist(&self, path: &Path) -> Result<usize> {
        let now = Instant::now();
        let file = {
            let inner = self.inner.lock();
            let entries = match inner.entries.as_ref() {
                Some(lru) => lru
                    .iter()
                    .rev()
                    .filter(|(_, entry)| !self.is_expired(entry, now))
                    .map(|(_, entry)| SideEntry {
                        task: entry.task.clone(),
                        access_count: entry.access_count,
                    })
                    .collect(),
                None => Vec::new(),
            };
            SideFile {
                version: SIDE_FILE_VERSION,
                entries,
            }
        };
        let bytes = serde_json::to_vec(&file)?;
        atomic_replace(path, &bytes)?;
        debug!(path = %path.display(), entries = file.entries.len(), "cache.persist.saved");
        Ok(file.entries.len())
    }

    /// Reloads entries from `path`. `current_version` returns the version of a task in
    /// the table; entries whose version differs are skipped. A missing or unreadable
    /// file leaves the cache empty.
    pub fn load<F>(&self, path: &Path, current_version: F) -> usize
    where
        F: Fn(&str) -> Option<u64>,
    {
        if !self.enabled() {
            return 0;
        }
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return 0,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cache.persist.load_failed");
                return 0;
            }
        };
        let file: SideFile = match serde_json::from_slice(&bytes) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cache.persist.load_failed");
                return 0;
            }
        };
        if file.version != SIDE_FILE_VERSION {
            warn!(version = file.version, "cache.persist.version_mismatch");
            return 0;
        }
        let now = Instant::now();
        let mut loaded = 0;
        let mut stale = 0;
        let mut inner = self.inner.lock();
        let Some(lru) = inner.entries.as_mut() else {
            return 0;
        };
        for SideEntry { task, access_count } in file.entries {
            if current_version(&task.path) != Some(task.version) {
                stale += 1;
                continue;
            }
            lru.push(
                task.path.clone(),
                CacheEntry {
                    task,
                    written_at: now,
                    accessed_at: now,
                    access_count,
                },
            );
            loaded += 1;
        }
        debug!(loaded, stale, "cache.persist.loaded");
        loaded
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        let idle = now.saturating_duration_since(entry.accessed_at);
        let age = now.saturating_duration_since(entry.written_at);
        idle > self.effective_ttl(entry.access_count) || age > self.options.max_ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewTask;
    use tempfile::tempdir;

    fn task(path: &str) -> Task {
        NewTask::new(path).into_task(1)
    }

    fn options(capacity: usize) -> CacheOptions {
        CacheOptions {
            capacity,
            base_ttl: Duration::from_secs(10),
            ttl_extension: Duration::from_secs(5),
            max_ttl: Duration::from_secs(30),
            persist: false,
        }
    }

    #[test]
    fn hit_and_miss_are_counted() {
        let cache = CacheManager::new(options(4));
        assert!(cache.get("p/a").is_none());
        cache.set(task("p/a"));
        assert_eq!(cache.get("p/a").unwrap().path, "p/a");
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn least_recent_entry_is_evicted() {
        let cache = CacheManager::new(options(2));
        cache.set(task("a"));
        cache.set(task("b"));
        cache.get("a");
        cache.set(task("c"));
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn overwrite_is_not_an_eviction() {
        let cache = CacheManager::new(options(2));
        cache.set(task("a"));
        cache.set(task("a"));
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn ttl_grows_with_access_and_caps() {
        let cache = CacheManager::new(options(4));
        assert_eq!(cache.effective_ttl(0), Duration::from_secs(10));
        assert_eq!(cache.effective_ttl(2), Duration::from_secs(20));
        assert_eq!(cache.effective_ttl(100), Duration::from_secs(30));
    }

    #[test]
    fn idle_entries_expire() {
        let cache = CacheManager::new(options(4));
        let start = Instant::now();
        cache.set_at(task("cold"), start);
        cache.set_at(task("warm"), start);
        for _ in 0..2 {
            cache.get_at("warm", start);
        }
        let later = start + Duration::from_secs(15);
        assert!(cache.get_at("cold", later).is_none());
        assert!(cache.get_at("warm", later).is_some());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn max_ttl_bounds_time_since_write() {
        let cache = CacheManager::new(options(4));
        let start = Instant::now();
        cache.set_at(task("hot"), start);
        for step in 1..=7u64 {
            assert!(cache
                .get_at("hot", start + Duration::from_secs(step * 4))
                .is_some());
        }
        assert!(cache.get_at("hot", start + Duration::from_secs(31)).is_none());
    }

    #[test]
    fn cleanup_drops_only_expired() {
        let cache = CacheManager::new(options(4));
        let start = Instant::now();
        cache.set_at(task("old"), start);
        cache.set_at(task("new"), start + Duration::from_secs(8));
        assert_eq!(cache.cleanup_at(start + Duration::from_secs(12)), 1);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn zero_capacity_disables_cache() {
        let cache = CacheManager::new(options(0));
        cache.set(task("a"));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn persisted_entries_reload_when_current() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.db.cache");
        let cache = CacheManager::new(options(4));
        cache.set(task("a"));
        cache.set(task("b"));
        cache.get("a");
        assert_eq!(cache.persist(&path).unwrap(), 2);

        let reloaded = CacheManager::new(options(4));
        let loaded = reloaded.load(&path, |p| if p == "a" { Some(1) } else { Some(9) });
        assert_eq!(loaded, 1);
        assert!(reloaded.get("a").is_some());
        assert!(reloaded.get("b").is_none());
    }

    #[test]
    fn corrupt_side_file_degrades_to_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.db.cache");
        fs::write(&path, b"\x00garbage").unwrap();
        let cache = CacheManager::new(options(4));
        assert_eq!(cache.load(&path, |_| Some(1)), 0);
        assert_eq!(cache.load(&dir.path().join("missing.cache"), |_| Some(1)), 0);
        assert_eq!(cache.stats().entries, 0);
    }
}
