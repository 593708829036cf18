//! On-disk reference backend.
//!
//! An archive is a `<base>.meta` JSON metadata file next to numbered JSON
//! data volumes `<base>.0`, `<base>.1`, ....  The highest-numbered volume is
//! the actively written one; earlier volumes are immutable.  The layout keeps
//! the refresher's stat-based freshness checks honest: metadata and volume
//! modification times are real filesystem mtimes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::debug;

use super::{
    ArchiveBackend, ArchiveHandle, DomainId, MemberId, MetricDesc, MetricId, Sample, Semantics,
    StorageId, ValueType,
};
use crate::error::{Error, Result};

pub const METADATA_SUFFIX: &str = ".meta";

/// Metadata file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveMeta {
    /// Self-reported source (host) name.
    pub source: String,
    /// Start of data, epoch seconds.
    pub begin: i64,
    pub metrics: Vec<MetaMetric>,
    #[serde(default)]
    pub domains: HashMap<u32, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaMetric {
    pub name: String,
    pub value_type: ValueType,
    pub semantics: Semantics,
    #[serde(default)]
    pub domain: Option<u32>,
}

/// One timestamped record within a data volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub time: i64,
    pub samples: Vec<RecordedSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedSample {
    pub name: String,
    #[serde(default)]
    pub member: Option<String>,
    pub value: f64,
}

/// Strip the metadata suffix to get the volume-file base path.
fn volume_base(id: &str) -> &str {
    id.strip_suffix(METADATA_SUFFIX).unwrap_or(id)
}

fn volume_path(id: &str, volume: u32) -> String {
    format!("{}.{}", volume_base(id), volume)
}

fn mtime_secs(path: &str) -> Option<i64> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    let since = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(since.as_secs() as i64)
}

fn walk_meta_files(dir: &Path, out: &mut Vec<StorageId>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_meta_files(&path, out);
        } else if path.extension().map_or(false, |ext| ext == "meta") {
            out.push(path.to_string_lossy().into_owned());
        }
    }
}

/// Filesystem-backed archive store.
#[derive(Debug, Default)]
pub struct FsBackend;

impl FsBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ArchiveBackend for FsBackend {
    async fn discover(&self, root: &Path) -> Result<Vec<StorageId>> {
        let root = root.to_path_buf();
        let found = tokio::task::spawn_blocking(move || -> Result<Vec<StorageId>> {
            if !root.is_dir() {
                return Err(Error::Backend(format!(
                    "archive root {} is not a directory",
                    root.display()
                )));
            }
            let mut out = Vec::new();
            walk_meta_files(&root, &mut out);
            out.sort();
            Ok(out)
        })
        .await
        .map_err(|e| Error::Internal(format!("archive walk task failed: {}", e)))??;
        debug!(archives = found.len(), "archive walk complete");
        Ok(found)
    }

    fn metadata_mtime(&self, id: &str) -> Option<i64> {
        mtime_secs(id)
    }

    fn volume_mtime(&self, id: &str, volume: u32) -> Option<i64> {
        mtime_secs(&volume_path(id, volume))
    }

    fn volume_exists(&self, id: &str, volume: u32) -> bool {
        Path::new(&volume_path(id, volume)).exists()
    }

    async fn open(&self, id: &str) -> Result<Box<dyn ArchiveHandle>> {
        let raw = tokio::fs::read(id)
            .await
            .map_err(|e| Error::Backend(format!("cannot read {}: {}", id, e)))?;
        let meta: ArchiveMeta = serde_json::from_slice(&raw)
            .map_err(|e| Error::Backend(format!("malformed metadata {}: {}", id, e)))?;

        let mut records = Vec::new();
        let mut volume = 0;
        loop {
            let path = volume_path(id, volume);
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let recs: Vec<VolumeRecord> = serde_json::from_slice(&bytes)
                        .map_err(|e| Error::Backend(format!("malformed volume {}: {}", path, e)))?;
                    records.extend(recs);
                    volume += 1;
                }
                Err(_) => break,
            }
        }
        records.sort_by_key(|r| r.time);

        Ok(Box::new(FsArchiveHandle {
            meta,
            records,
            interp: None,
        }))
    }
}

struct Interpolation {
    next: i64,
    step: i64,
}

/// An open filesystem archive: parsed metadata plus all volume records in
/// time order.
pub struct FsArchiveHandle {
    meta: ArchiveMeta,
    records: Vec<VolumeRecord>,
    interp: Option<Interpolation>,
}

#[async_trait]
impl ArchiveHandle for FsArchiveHandle {
    fn source_name(&self) -> &str {
        &self.meta.source
    }

    fn begin_time(&self) -> i64 {
        self.meta.begin
    }

    async fn end_time(&mut self) -> Result<i64> {
        Ok(self
            .records
            .last()
            .map(|r| r.time)
            .unwrap_or(self.meta.begin))
    }

    async fn lookup_name(&mut self, name: &str) -> Result<Option<MetricId>> {
        Ok(self
            .meta
            .metrics
            .iter()
            .position(|m| m.name == name)
            .map(|i| MetricId(i as u32)))
    }

    async fn lookup_desc(&mut self, id: MetricId) -> Result<MetricDesc> {
        let metric = self
            .meta
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
        self.meta
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
        let members = self
            .meta
            .domains
            .get(&domain.0)
            .ok_or_else(|| Error::Backend(format!("unknown index domain {}", domain.0)))?;
        Ok(members
            .iter()
            .position(|m| m == member)
            .map(|i| MemberId(i as u32)))
    }

    async fn metric_names(&mut self) -> Result<Vec<String>> {
        Ok(self.meta.metrics.iter().map(|m| m.name.clone()).collect())
    }

    fn set_interpolation(&mut self, origin: i64, step: i64) {
        self.interp = Some(Interpolation { next: origin, step });
    }

    async fn fetch_interpolated(&mut self, ids: &[MetricId]) -> Result<Vec<Sample>> {
        let interp = self
            .interp
            .as_mut()
            .ok_or_else(|| Error::Backend("interpolation mode not set".to_string()))?;
        let t = interp.next;
        interp.next += interp.step;

        let mut out = Vec::new();
        for &id in ids {
            let metric = match self.meta.metrics.get(id.0 as usize) {
                Some(m) => m,
                None => continue,
            };
            // last observation at or before the interpolation position,
            // tracked per index-domain member
            let mut latest: HashMap<Option<String>, f64> = HashMap::new();
            for record in &self.records {
                if record.time > t {
                    break;
                }
                for sample in &record.samples {
                    if sample.name == metric.name {
                        latest.insert(sample.member.clone(), sample.value);
                    }
                }
            }
            for (member, value) in latest {
                let member_id = match (member, metric.domain) {
                    (None, _) => None,
                    (Some(label), Some(domain)) => {
                        match self
                            .meta
                            .domains
                            .get(&domain)
                            .and_then(|members| members.iter().position(|m| *m == label))
                        {
                            Some(i) => Some(MemberId(i as u32)),
                            None => continue,
                        }
                    }
                    // recorded member for a domain-less metric: skip
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
