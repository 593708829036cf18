//! Cache refresh orchestration.
//!
//! `refresh_all` is called on every query, so it must be cheap: a rate
//! limiter makes it a no-op inside the minimum interval, and per-entry work
//! is bounded by a squid-style freshness heuristic that lets old, quiet
//! archives skip all I/O.  The trade-off is bounded staleness: an entry
//! assumed fresh but changed or vanished serves temporarily incomplete data,
//! never wrong types or dangling entries.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ArchiveCache, ArchiveEntry, Clock, END_TIME_POISONED};
use crate::archive::fs::METADATA_SUFFIX;
use crate::archive::{ArchiveBackend, ArchiveHandle, DomainId, StorageId};
use crate::codec::{self, EncodingMode};
use crate::error::Result;
use crate::name::{MetricName, COVERAGE_METRIC};
use crate::shutdown::Shutdown;

/// Where an archive's metric-name prefix comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrefixSource {
    /// Reversible encoding of the storage path, relative to the archive
    /// root.
    #[default]
    Path,
    /// One-way readable encoding of the archive's self-reported host name.
    Host,
}

/// Tunables for the refresh policy.  The heuristics carry no correctness
/// invariant beyond monotonic staleness bounding; the defaults are the
/// empirically tuned ones.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub archive_root: PathBuf,
    /// Full rescans are suppressed inside this window, in seconds.
    pub min_refresh_interval: i64,
    /// An archive is assumed fresh for this fraction of the time it has
    /// already been quiescent.
    pub freshness_ratio: f64,
    pub encoding: EncodingMode,
    pub prefix_source: PrefixSource,
    /// Emit cache statistics at most this often, in seconds; 0 disables.
    pub stats_interval: i64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            archive_root: PathBuf::from("."),
            min_refresh_interval: 60,
            freshness_ratio: 0.5,
            encoding: EncodingMode::default(),
            prefix_source: PrefixSource::default(),
            stats_interval: 0,
        }
    }
}

#[derive(Debug, Default)]
struct RefreshState {
    last_full_refresh: i64,
    last_stats_dump: i64,
}

/// Owns the staleness heuristic and the rescan schedule for an
/// [`ArchiveCache`].
pub struct CacheRefresher {
    cache: Arc<ArchiveCache>,
    backend: Arc<dyn ArchiveBackend>,
    clock: Arc<dyn Clock>,
    config: RefreshConfig,
    shutdown: Shutdown,
    state: Mutex<RefreshState>,
}

impl CacheRefresher {
    pub fn new(
        cache: Arc<ArchiveCache>,
        backend: Arc<dyn ArchiveBackend>,
        clock: Arc<dyn Clock>,
        config: RefreshConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            cache,
            backend,
            clock,
            config,
            shutdown,
            state: Mutex::new(RefreshState::default()),
        }
    }

    pub fn cache(&self) -> &Arc<ArchiveCache> {
        &self.cache
    }

    /// Bring the whole cache acceptably up to date.
    ///
    /// At most one pass runs at a time; callers arriving during a pass or
    /// inside the rate-limit window return immediately and read the cache as
    /// it stands.
    pub async fn refresh_all(&self) {
        let mut state = match self.state.try_lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let started = self.clock.now();
        if state.last_full_refresh > 0
            && state.last_full_refresh + self.config.min_refresh_interval >= started
        {
            return;
        }
        state.last_full_refresh = started;

        debug!(root = %self.config.archive_root.display(), "searching for archives");

        // Phase 1: rescan the directory tree.
        let mut refreshed: HashSet<StorageId> = HashSet::new();
        let mut num_archives = 0usize;
        let mut last_report = started;
        match self.backend.discover(&self.config.archive_root).await {
            Ok(ids) => {
                for id in ids {
                    if self.shutdown.is_set() {
                        break;
                    }
                    num_archives += 1;
                    refreshed.insert(id.clone());
                    self.refresh_one(&id).await;

                    let now = self.clock.now();
                    if now >= last_report + 2 {
                        last_report = now;
                        debug!(archives = num_archives, "refresh in progress");
                    }
                }
            }
            Err(e) => {
                warn!(
                    root = %self.config.archive_root.display(),
                    error = %e,
                    "cannot scan archive root"
                );
            }
        }

        // Phase 2: revisit cached archives the walk missed, so archives
        // that vanished are still evicted.  Runs even during shutdown, when
        // refresh_one clears each entry out.
        for id in self.cache.storage_ids() {
            if refreshed.contains(&id) {
                continue;
            }
            num_archives += 1;
            self.refresh_one(&id).await;
        }

        let finished = self.clock.now();
        if finished >= started + 2 {
            debug!(
                archives = num_archives,
                seconds = finished - started,
                "archive refresh complete"
            );
        }

        if self.config.stats_interval > 0
            && state.last_stats_dump + self.config.stats_interval <= finished
        {
            let (files, prefixes) = self.cache.stats();
            info!(files, prefixes, "archive cache stats");
            state.last_stats_dump = finished;
        }
    }

    /// Create (if new) or refresh (if needed) one archive's cache entry.
    ///
    /// On success the entry is present in both indices; when the backing
    /// storage is gone the entry is removed from both, never left dangling.
    pub async fn refresh_one(&self, storage_id: &str) {
        let now = self.clock.now();

        if self.shutdown.is_set() {
            if self.cache.evict(storage_id).is_some() {
                debug!(archive = storage_id, "evicted entry during shutdown");
            }
            return;
        }

        let mut handle: Option<Box<dyn ArchiveHandle>> = None;
        let mut entry = match self.cache.get(storage_id) {
            Some(existing) => existing,
            None => {
                // a new archive: open it once to capture label and prefix
                let opened = match self.backend.open(storage_id).await {
                    Ok(h) => h,
                    Err(e) => {
                        warn!(archive = storage_id, error = %e, "cannot open archive");
                        return;
                    }
                };
                let prefix = self.derive_prefix(storage_id, opened.source_name());
                let entry =
                    ArchiveEntry::new(storage_id.to_string(), prefix, opened.begin_time());
                self.cache.store(entry.clone());
                handle = Some(opened);
                entry
            }
        };

        // A quiescent archive is assumed to stay fresh for a fraction of the
        // time it has already been unchanged, so routine refresh costs no
        // I/O at all for the vast majority of archives.
        if entry.last_refresh_time > 0 && entry.last_volume_mtime > 0 {
            let age_at_last_refresh = entry.last_refresh_time - entry.last_volume_mtime;
            let assume_fresh_until = entry.last_refresh_time
                + (self.config.freshness_ratio * age_at_last_refresh as f64) as i64;
            if now < assume_fresh_until {
                return;
            }
        }

        // Metadata freshness costs one stat.  The quiescence heuristic must
        // not shortcut this: a metadata file is often much older than an
        // active volume when the metric set stopped changing at startup.
        match self.backend.metadata_mtime(storage_id) {
            None => {
                self.cache.evict(storage_id);
                info!(archive = storage_id, "retiring vanished archive");
                return;
            }
            Some(mtime) if mtime == entry.metadata_mtime => {
                // metric list still valid
            }
            Some(mtime) => {
                if handle.is_none() {
                    match self.backend.open(storage_id).await {
                        Ok(h) => handle = Some(h),
                        Err(e) => {
                            warn!(archive = storage_id, error = %e, "cannot open archive");
                            return;
                        }
                    }
                }
                if let Some(h) = handle.as_mut() {
                    match self.enumerate_metrics(h.as_mut()).await {
                        Ok(metrics) => {
                            debug!(
                                archive = storage_id,
                                metrics = metrics.len(),
                                "enumerated metrics"
                            );
                            entry.metrics = Arc::new(metrics);
                            entry.metadata_mtime = mtime;
                            entry.last_refresh_time = now;
                        }
                        Err(e) => {
                            warn!(archive = storage_id, error = %e, "cannot enumerate metrics");
                            return;
                        }
                    }
                }
            }
        }

        // Volume freshness: the end time moves with every write to the
        // active volume.  An unreadable volume means a compressed, dormant
        // archive whose cached end time is still accurate.
        match self
            .backend
            .volume_mtime(storage_id, entry.last_volume_index)
        {
            None => {}
            Some(volume_mtime) => {
                let next_exists = self
                    .backend
                    .volume_exists(storage_id, entry.last_volume_index + 1);
                let unchanged = entry.last_volume_mtime != 0
                    && entry.last_volume_mtime == volume_mtime
                    && !next_exists;
                if !unchanged {
                    if handle.is_none() {
                        match self.backend.open(storage_id).await {
                            Ok(h) => handle = Some(h),
                            Err(e) => {
                                entry.end = END_TIME_POISONED;
                                entry.last_volume_mtime = now;
                                self.cache.store(entry);
                                warn!(
                                    archive = storage_id,
                                    error = %e,
                                    "cannot open archive; poisoning cached end time"
                                );
                                return;
                            }
                        }
                    }
                    if let Some(h) = handle.as_mut() {
                        match h.end_time().await {
                            Ok(end) => entry.end = end,
                            Err(e) => {
                                entry.end = END_TIME_POISONED;
                                warn!(
                                    archive = storage_id,
                                    error = %e,
                                    "cannot read archive end; poisoning cached end time"
                                );
                            }
                        }
                    }
                    let mut recorded_mtime = volume_mtime;
                    if next_exists {
                        // assume the archive rolled over by one volume; a
                        // further rollover triggers again at the next refresh
                        entry.last_volume_index += 1;
                        match self
                            .backend
                            .volume_mtime(storage_id, entry.last_volume_index)
                        {
                            Some(m) => recorded_mtime = m,
                            None => warn!(
                                archive = storage_id,
                                volume = entry.last_volume_index,
                                "cannot stat new volume"
                            ),
                        }
                    }
                    entry.last_volume_mtime = recorded_mtime;
                    entry.last_refresh_time = now;
                }
            }
        }

        debug!(
            archive = storage_id,
            prefix = %entry.name_prefix,
            metrics = entry.metrics.len(),
            "refreshed archive entry"
        );
        self.cache.store(entry);
    }

    /// Walk one archive's name namespace into graphite-compatible leaf
    /// names, starting with the coverage pseudo-metric.
    async fn enumerate_metrics(
        &self,
        handle: &mut dyn ArchiveHandle,
    ) -> Result<Vec<MetricName>> {
        let mut out = vec![MetricName::leaf(COVERAGE_METRIC)];
        // many names share one domain within an archive; list members once
        let mut domain_parts: HashMap<DomainId, Vec<String>> = HashMap::new();

        for name in handle.metric_names().await? {
            if self.shutdown.is_set() {
                break;
            }
            if name.is_empty() {
                continue;
            }
            let id = match handle.lookup_name(&name).await {
                Ok(Some(id)) => id,
                _ => continue,
            };
            let desc = match handle.lookup_desc(id).await {
                Ok(desc) => desc,
                Err(_) => continue,
            };
            if !desc.value_type.is_numeric() {
                continue;
            }
            match desc.domain {
                None => out.push(MetricName::leaf(&name)),
                Some(domain) => {
                    if !domain_parts.contains_key(&domain) {
                        let members =
                            handle.list_domain_members(domain).await.unwrap_or_default();
                        let encoded = members
                            .iter()
                            .filter(|m| !m.is_empty())
                            .map(|m| codec::encode(m, self.config.encoding))
                            .collect();
                        domain_parts.insert(domain, encoded);
                    }
                    if let Some(parts) = domain_parts.get(&domain) {
                        for part in parts {
                            out.push(MetricName::with_tail(&name, part));
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Compute the graphite name prefix for an archive: either a readable
    /// rendering of its host name, or a reversible encoding of its storage
    /// path relative to the archive root.
    fn derive_prefix(&self, storage_id: &str, source_name: &str) -> String {
        let prefix = match self.config.prefix_source {
            PrefixSource::Host => codec::encode_1way(source_name),
            PrefixSource::Path => {
                let root = self.config.archive_root.to_string_lossy();
                let mut part = storage_id
                    .strip_prefix(&format!("{}/", root))
                    .unwrap_or(storage_id)
                    .to_string();
                if self.config.encoding == EncodingMode::Tilde {
                    if let Some(stripped) = part.strip_suffix(METADATA_SUFFIX) {
                        part = stripped.to_string();
                    }
                }
                if part.is_empty() {
                    part = storage_id.to_string();
                }
                codec::encode(&part, self.config.encoding)
            }
        };
        if prefix.is_empty() {
            "unknown".to_string()
        } else {
            prefix
        }
    }
}
