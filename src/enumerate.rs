//! Pattern-based metric enumeration over the archive cache.
//!
//! A dot-separated shell-style glob is matched component-wise: the first
//! component selects archive prefixes, the rest select cached metric-name
//! components.  A shorter pattern is an implicit wildcard for the remaining
//! components.

use glob::Pattern;
use std::sync::Arc;
use tracing::debug;

use crate::cache::{ArchiveCache, CacheRefresher};
use crate::name::MetricName;

/// Answers "which cached metric names match this pattern inside this time
/// window".  Triggers a cache refresh before every scan.
pub struct MetricEnumerator {
    cache: Arc<ArchiveCache>,
    refresher: Arc<CacheRefresher>,
}

/// Compiled per-component patterns.  An invalid glob component matches
/// nothing; it came from an untrusted query string.
fn compile(patterns: &[String]) -> Vec<Option<Pattern>> {
    patterns.iter().map(|p| Pattern::new(p).ok()).collect()
}

fn component_matches(pattern: &Option<Pattern>, component: &str) -> bool {
    match pattern {
        Some(p) => p.matches(component),
        None => false,
    }
}

impl MetricEnumerator {
    pub fn new(cache: Arc<ArchiveCache>, refresher: Arc<CacheRefresher>) -> Self {
        Self { cache, refresher }
    }

    /// Enumerate matches for a dot-separated pattern string.
    pub async fn enumerate(&self, pattern: &str, t_start: i64, t_end: i64) -> Vec<MetricName> {
        let components: Vec<String> = pattern.split('.').map(str::to_string).collect();
        self.enumerate_components(&components, t_start, t_end).await
    }

    /// Enumerate matches for pre-tokenized pattern components, restricted to
    /// archives overlapping `[t_start, t_end]`.
    ///
    /// Matching names come back as `(archive prefix, metric name)`
    /// composites, sorted and deduplicated: two archives may share a derived
    /// prefix and contribute the same composite.
    pub async fn enumerate_components(
        &self,
        patterns: &[String],
        t_start: i64,
        t_end: i64,
    ) -> Vec<MetricName> {
        self.refresher.refresh_all().await;

        let compiled = compile(patterns);
        let mut out = Vec::new();

        // A glob over the archive prefix cannot be index-accelerated, so
        // this scans the whole prefix index.
        for entry in self.cache.entries_in_prefix_order() {
            if let Some(first) = compiled.first() {
                if !component_matches(first, &entry.name_prefix) {
                    continue;
                }
            }
            if !entry.overlaps(t_start, t_end) {
                continue;
            }

            for metric in entry.metrics.iter() {
                let components = metric.split();
                let matched = components.iter().enumerate().all(|(i, component)| {
                    match compiled.get(i + 1) {
                        // patterns[0] was used for the archive prefix
                        Some(pattern) => component_matches(pattern, component),
                        None => true,
                    }
                });
                if matched {
                    out.push(MetricName::prefixed(&entry.name_prefix, metric));
                }
            }
        }

        out.sort();
        out.dedup();
        debug!(count = out.len(), "enumerated metrics");
        out
    }
}
