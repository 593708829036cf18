//! Process-wide archive metadata cache.
//!
//! One [`ArchiveEntry`] per distinct archive storage location, indexed both
//! by storage identifier (unique) and by derived metric-name prefix
//! (multi-valued: several archives from the same host share a prefix).  The
//! two indices are always updated together.  Query paths only read; all
//! mutation happens on the refresh path, which runs one pass at a time.

pub mod refresher;

pub use refresher::{CacheRefresher, PrefixSource, RefreshConfig};

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::archive::StorageId;
use crate::name::MetricName;

/// End-time sentinel for an entry whose live end has not been read yet: the
/// archive is assumed to extend into the future until a volume check says
/// otherwise.
pub const END_TIME_UNKNOWN: i64 = i64::MAX;

/// End-time sentinel for an entry whose end-time read failed: clearly in the
/// past, so the archive drops out of queries instead of serving stale data.
pub const END_TIME_POISONED: i64 = 0;

/// Injected time source, so refresh logic is testable without wall-clock
/// time.
pub trait Clock: Send + Sync + 'static {
    /// Current time in epoch seconds.
    fn now(&self) -> i64;
}

/// Wall-clock time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// Cached metadata for one archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Identifier for reopening the archive.
    pub storage_id: StorageId,
    /// Derived graphite-style prefix; fixed for the life of the entry.
    pub name_prefix: String,
    /// Start of the archive's data.
    pub begin: i64,
    /// Cached end of the archive's data; see the `END_TIME_*` sentinels.
    pub end: i64,
    /// All graphite-compatible leaf names, including the coverage
    /// pseudo-metric.  Shared so clones of the entry stay cheap.
    pub metrics: Arc<Vec<MetricName>>,
    pub metadata_mtime: i64,
    pub last_volume_mtime: i64,
    pub last_volume_index: u32,
    pub last_refresh_time: i64,
}

impl ArchiveEntry {
    /// A freshly discovered entry with all freshness bookkeeping marked
    /// "never refreshed".
    pub fn new(storage_id: StorageId, name_prefix: String, begin: i64) -> Self {
        Self {
            storage_id,
            name_prefix,
            begin,
            end: END_TIME_UNKNOWN,
            metrics: Arc::new(Vec::new()),
            metadata_mtime: 0,
            last_volume_mtime: 0,
            last_volume_index: 0,
            last_refresh_time: 0,
        }
    }

    /// Whether the archive's data overlaps the inclusive query window.
    pub fn overlaps(&self, t_start: i64, t_end: i64) -> bool {
        self.end >= t_start && self.begin <= t_end
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    by_storage: HashMap<StorageId, ArchiveEntry>,
    by_prefix: BTreeMap<String, Vec<StorageId>>,
}

/// The cache table with its two indices.
#[derive(Debug, Default)]
pub struct ArchiveCache {
    inner: RwLock<CacheInner>,
}

impl ArchiveCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an entry by storage identifier.
    pub fn get(&self, storage_id: &str) -> Option<ArchiveEntry> {
        self.inner.read().by_storage.get(storage_id).cloned()
    }

    /// Insert or replace an entry, keeping both indices in step.
    pub fn store(&self, entry: ArchiveEntry) {
        let mut inner = self.inner.write();
        if let Some(previous) = inner.by_storage.get(&entry.storage_id) {
            if previous.name_prefix != entry.name_prefix {
                let old_prefix = previous.name_prefix.clone();
                remove_prefix_mapping(&mut inner, &old_prefix, &entry.storage_id);
                add_prefix_mapping(&mut inner, &entry.name_prefix, &entry.storage_id);
            }
        } else {
            add_prefix_mapping(&mut inner, &entry.name_prefix, &entry.storage_id);
        }
        inner.by_storage.insert(entry.storage_id.clone(), entry);
    }

    /// Remove an entry from both indices.  Returns the removed entry, if
    /// any.
    pub fn evict(&self, storage_id: &str) -> Option<ArchiveEntry> {
        let mut inner = self.inner.write();
        let entry = inner.by_storage.remove(storage_id)?;
        let prefix = entry.name_prefix.clone();
        remove_prefix_mapping(&mut inner, &prefix, storage_id);
        Some(entry)
    }

    /// Every known storage identifier.
    pub fn storage_ids(&self) -> Vec<StorageId> {
        self.inner.read().by_storage.keys().cloned().collect()
    }

    /// All entries, iterated in prefix order.
    pub fn entries_in_prefix_order(&self) -> Vec<ArchiveEntry> {
        let inner = self.inner.read();
        let mut out = Vec::with_capacity(inner.by_storage.len());
        for ids in inner.by_prefix.values() {
            for id in ids {
                if let Some(entry) = inner.by_storage.get(id) {
                    out.push(entry.clone());
                }
            }
        }
        out
    }

    /// Entries whose derived prefix equals `prefix` exactly.
    pub fn entries_for_prefix(&self, prefix: &str) -> Vec<ArchiveEntry> {
        let inner = self.inner.read();
        inner
            .by_prefix
            .get(prefix)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_storage.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// (entry count, distinct prefix count) for periodic stats reporting.
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.inner.read();
        (inner.by_storage.len(), inner.by_prefix.len())
    }
}

fn add_prefix_mapping(inner: &mut CacheInner, prefix: &str, storage_id: &str) {
    inner
        .by_prefix
        .entry(prefix.to_string())
        .or_default()
        .push(storage_id.to_string());
}

fn remove_prefix_mapping(inner: &mut CacheInner, prefix: &str, storage_id: &str) {
    if let Some(ids) = inner.by_prefix.get_mut(prefix) {
        ids.retain(|id| id != storage_id);
        if ids.is_empty() {
            inner.by_prefix.remove(prefix);
        }
    }
}
