//! Shared test fixtures: a fully in-memory archive backend with instrumented
//! stat/open counters, and a manually advanced clock.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use metricshed_core::archive::{
    ArchiveBackend, ArchiveHandle, DomainId, MemberId, MetricDesc, MetricId, Sample, Semantics,
    StorageId, ValueType,
};
use metricshed_core::error::{Error, Result};
use metricshed_core::{Clock, Shutdown};

/// A clock the test advances by hand.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn at(start: i64) -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(start)))
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Description of one simulated metric.
#[derive(Debug, Clone)]
pub struct MockMetric {
    pub name: String,
    pub value_type: ValueType,
    pub semantics: Semantics,
    pub domain: Option<u32>,
}

impl MockMetric {
    pub fn instant(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value_type: ValueType::F64,
            semantics: Semantics::Instant,
            domain: None,
        }
    }

    pub fn counter(name: &str) -> Self {
        Self {
            semantics: Semantics::Counter,
            ..Self::instant(name)
        }
    }

    pub fn text(name: &str) -> Self {
        Self {
            value_type: ValueType::Text,
            ..Self::instant(name)
        }
    }

    pub fn with_domain(mut self, domain: u32) -> Self {
        self.domain = Some(domain);
        self
    }
}

/// One simulated archive.
#[derive(Debug, Clone)]
pub struct MockArchive {
    pub source: String,
    pub begin: i64,
    pub end: i64,
    pub metadata_mtime: i64,
    /// Volume index -> mtime.
    pub volumes: HashMap<u32, i64>,
    pub metrics: Vec<MockMetric>,
    pub domains: HashMap<u32, Vec<String>>,
    /// (metric name, member label) -> timestamped values, ascending.
    pub samples: HashMap<(String, Option<String>), Vec<(i64, f64)>>,
}

impl MockArchive {
    pub fn new(source: &str, begin: i64, end: i64) -> Self {
        Self {
            source: source.to_string(),
            begin,
            end,
            metadata_mtime: begin,
            volumes: HashMap::from([(0, end)]),
            metrics: Vec::new(),
            domains: HashMap::new(),
            samples: HashMap::new(),
        }
    }

    pub fn metric(mut self, metric: MockMetric) -> Self {
        self.metrics.push(metric);
        self
    }

    pub fn domain(mut self, id: u32, members: &[&str]) -> Self {
        self.domains
            .insert(id, members.iter().map(|m| m.to_string()).collect());
        self
    }

    /// Record `(start + i*step, start_value + i*increment)` samples across
    /// the archive's span.
    pub fn sampled(
        mut self,
        metric: &str,
        member: Option<&str>,
        step: i64,
        start_value: f64,
        increment: f64,
    ) -> Self {
        let mut values = Vec::new();
        let mut t = self.begin;
        let mut v = start_value;
        while t <= self.end {
            values.push((t, v));
            t += step;
            v += increment;
        }
        self.samples
            .insert((metric.to_string(), member.map(str::to_string)), values);
        self
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    pub opens: AtomicUsize,
    pub stats: AtomicUsize,
}

/// In-memory backend over a mutable set of [`MockArchive`]s.
#[derive(Default)]
pub struct MockBackend {
    archives: Mutex<HashMap<StorageId, MockArchive>>,
    /// Storage ids the directory walk reports; independent of the archive
    /// map so tests can simulate a capped or stale walk.
    discoverable: Mutex<Vec<StorageId>>,
    pub counters: Counters,
    /// When set, open() fails for these ids.
    unopenable: Mutex<Vec<StorageId>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, id: &str, archive: MockArchive) {
        self.archives.lock().insert(id.to_string(), archive);
        let mut discoverable = self.discoverable.lock();
        if !discoverable.iter().any(|d| d == id) {
            discoverable.push(id.to_string());
            discoverable.sort();
        }
    }

    /// Remove the archive entirely: gone from the walk and from stat.
    pub fn remove(&self, id: &str) {
        self.archives.lock().remove(id);
        self.discoverable.lock().retain(|d| d != id);
    }

    /// Hide from the directory walk only; stat and open still work.
    pub fn hide_from_walk(&self, id: &str) {
        self.discoverable.lock().retain(|d| d != id);
    }

    pub fn fail_open(&self, id: &str) {
        self.unopenable.lock().push(id.to_string());
    }

    pub fn touch_metadata(&self, id: &str, mtime: i64) {
        if let Some(archive) = self.archives.lock().get_mut(id) {
            archive.metadata_mtime = mtime;
        }
    }

    pub fn touch_volume(&self, id: &str, volume: u32, mtime: i64) {
        if let Some(archive) = self.archives.lock().get_mut(id) {
            archive.volumes.insert(volume, mtime);
        }
    }

    pub fn set_end(&self, id: &str, end: i64) {
        if let Some(archive) = self.archives.lock().get_mut(id) {
            archive.end = end;
        }
    }

    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> usize {
        self.counters.stats.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArchiveBackend for MockBackend {
    async fn discover(&self, _root: &Path) -> Result<Vec<StorageId>> {
        Ok(self.discoverable.lock().clone())
    }

    fn metadata_mtime(&self, id: &str) -> Option<i64> {
        self.counters.stats.fetch_add(1, Ordering::SeqCst);
        self.archives.lock().get(id).map(|a| a.metadata_mtime)
    }

    fn volume_mtime(&self, id: &str, volume: u32) -> Option<i64> {
        self.counters.stats.fetch_add(1, Ordering::SeqCst);
        self.archives
            .lock()
            .get(id)
            .and_then(|a| a.volumes.get(&volume).copied())
    }

    fn volume_exists(&self, id: &str, volume: u32) -> bool {
        self.archives
            .lock()
            .get(id)
            .map_or(false, |a| a.volumes.contains_key(&volume))
    }

    async fn open(&self, id: &str) -> Result<Box<dyn ArchiveHandle>> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if self.unopenable.lock().iter().any(|u| u == id) {
            return Err(Error::Backend(format!("cannot open {}", id)));
        }
        let archive = self
            .archives
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("no such archive {}", id)))?;
        Ok(Box::new(MockHandle {
            archive,
            interp: None,
        }))
    }
}

struct MockHandle {
    archive: MockArchive,
    interp: Option<(i64, i64)>,
}

#[async_trait]
impl ArchiveHandle for MockHandle {
    fn source_name(&self) -> &str {
        &self.archive.source
    }

    fn begin_time(&self) -> i64 {
        self.archive.begin
    }

    async fn end_time(&mut self) -> Result<i64> {
        Ok(self.archive.end)
    }

    async fn lookup_name(&mut self, name: &str) -> Result<Option<MetricId>> {
        Ok(self
            .archive
            .metrics
            .iter()
            .position(|m| m.name == name)
            .map(|i| MetricId(i as u32)))
    }

    async fn lookup_desc(&mut self, id: MetricId) -> Result<MetricDesc> {
        let metric = self
            .archive
            .metrics
            .get(id.0 as usize)
            .ok_or_else(|| Error::Backend(format!("unknown metric id {}", id.0)))?;
        Ok(MetricDesc {
            value_type: metric.value_type,
            semantics: metric.semantics,
            domain: metric.domain.map(DomainId),
        })
    }

    async fn list_domain_members(&mut self, domain: DomainId) -> Result<Vec<String>> {
        self.archive
            .domains
            .get(&domain.0)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("unknown index domain {}", domain.0)))
    }

    async fn lookup_domain_member(
        &mut self,
        domain: DomainId,
        member: &str,
    ) -> Result<Option<MemberId>> {
        Ok(self
            .archive
            .domains
            .get(&domain.0)
            .and_then(|members| members.iter().position(|m| m == member))
            .map(|i| MemberId(i as u32)))
    }

    async fn metric_names(&mut self) -> Result<Vec<String>> {
        Ok(self.archive.metrics.iter().map(|m| m.name.clone()).collect())
    }

    fn set_interpolation(&mut self, origin: i64, step: i64) {
        self.interp = Some((origin, step));
    }

    async fn fetch_interpolated(&mut self, ids: &[MetricId]) -> Result<Vec<Sample>> {
        let (next, step) = self
            .interp
            .ok_or_else(|| Error::Backend("interpolation mode not set".to_string()))?;
        self.interp = Some((next + step, step));
        let t = next;

        let mut out = Vec::new();
        for &id in ids {
            let metric = match self.archive.metrics.get(id.0 as usize) {
                Some(m) => m,
                None => continue,
            };
            for ((name, member), values) in &self.archive.samples {
                if *name != metric.name {
                    continue;
                }
                // last observation at or before the interpolation position
                let value = values
                    .iter()
                    .take_while(|(vt, _)| *vt <= t)
                    .last()
                    .map(|(_, v)| *v);
                let Some(value) = value else { continue };
                let member_id = match (member, metric.domain) {
                    (None, _) => None,
                    (Some(label), Some(domain)) => {
                        match self
                            .archive
                            .domains
                            .get(&domain)
                            .and_then(|members| members.iter().position(|m| m == label))
                        {
                            Some(i) => Some(MemberId(i as u32)),
                            None => continue,
                        }
                    }
                    (Some(_), None) => continue,
                };
                out.push(Sample {
                    id,
                    member: member_id,
                    value,
                });
            }
        }
        Ok(out)
    }
}

/// Wire a cache + refresher + enumerator around a mock backend.
pub struct Harness {
    pub backend: Arc<MockBackend>,
    pub clock: Arc<ManualClock>,
    pub cache: Arc<metricshed_core::ArchiveCache>,
    pub refresher: Arc<metricshed_core::CacheRefresher>,
    pub enumerator: Arc<metricshed_core::MetricEnumerator>,
    pub shutdown: Shutdown,
}

impl Harness {
    pub fn new(start: i64) -> Self {
        Self::with_config(start, metricshed_core::RefreshConfig::default())
    }

    pub fn with_config(start: i64, config: metricshed_core::RefreshConfig) -> Self {
        let backend = MockBackend::new();
        let clock = ManualClock::at(start);
        let cache = Arc::new(metricshed_core::ArchiveCache::new());
        let shutdown = Shutdown::new();
        let refresher = Arc::new(metricshed_core::CacheRefresher::new(
            Arc::clone(&cache),
            backend.clone(),
            clock.clone(),
            config,
            shutdown.clone(),
        ));
        let enumerator = Arc::new(metricshed_core::MetricEnumerator::new(
            Arc::clone(&cache),
            Arc::clone(&refresher),
        ));
        Self {
            backend,
            clock,
            cache,
            refresher,
            enumerator,
            shutdown,
        }
    }

    pub fn scheduler(&self, workers: usize) -> metricshed_core::FetchScheduler {
        metricshed_core::FetchScheduler::new(
            Arc::clone(&self.cache),
            self.backend.clone(),
            metricshed_core::FetchConfig {
                workers,
                base_step: 60,
                encoding: metricshed_core::EncodingMode::Tilde,
            },
            self.shutdown.clone(),
        )
    }
}
