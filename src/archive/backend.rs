//! The archive backend trait pair.
//!
//! [`ArchiveBackend`] covers discovery and the stat surface the cache
//! refresher depends on; [`ArchiveHandle`] covers everything that needs an
//! open archive.  Handles are opened and dropped within the scope of a single
//! refresh or fetch call, never cached across calls.

use async_trait::async_trait;
use std::path::Path;

use super::{DomainId, MemberId, MetricDesc, MetricId, Sample, StorageId};
use crate::error::Result;

/// Access to an archive store as a whole.
#[async_trait]
pub trait ArchiveBackend: Send + Sync + 'static {
    /// Walk the archive root and return the storage identifiers of every
    /// archive found.  The walk may be unavailable or capped; the refresher
    /// compensates with a residual rescan of already-known archives.
    async fn discover(&self, root: &Path) -> Result<Vec<StorageId>>;

    /// Modification time of the archive's metadata file, in epoch seconds;
    /// None when the backing storage no longer exists.
    fn metadata_mtime(&self, id: &str) -> Option<i64>;

    /// Modification time of one data volume, in epoch seconds; None when the
    /// volume cannot be read (compressed or vanished).
    fn volume_mtime(&self, id: &str, volume: u32) -> Option<i64>;

    /// Whether a data volume with the given index exists.
    fn volume_exists(&self, id: &str, volume: u32) -> bool;

    /// Open an archive for metadata and data access.
    async fn open(&self, id: &str) -> Result<Box<dyn ArchiveHandle>>;
}

/// An open archive.  Dropping the handle closes it.
#[async_trait]
pub trait ArchiveHandle: Send {
    /// The self-reported source (host) name recorded in the archive label.
    fn source_name(&self) -> &str;

    /// Start of the archive's data, from its label.
    fn begin_time(&self) -> i64;

    /// Current end of the archive's data.
    async fn end_time(&mut self) -> Result<i64>;

    /// Resolve a metric name to its numeric identifier.
    async fn lookup_name(&mut self, name: &str) -> Result<Option<MetricId>>;

    /// Descriptor for a previously resolved metric.
    async fn lookup_desc(&mut self, id: MetricId) -> Result<MetricDesc>;

    /// All member labels of a value-index domain.
    async fn list_domain_members(&mut self, domain: DomainId) -> Result<Vec<String>>;

    /// Resolve one member label within a value-index domain.
    async fn lookup_domain_member(
        &mut self,
        domain: DomainId,
        member: &str,
    ) -> Result<Option<MemberId>>;

    /// Every metric name recorded in the archive.
    async fn metric_names(&mut self) -> Result<Vec<String>>;

    /// Anchor interpolated fetching at `origin` with the given step.  Each
    /// subsequent [`ArchiveHandle::fetch_interpolated`] call advances one
    /// step.
    fn set_interpolation(&mut self, origin: i64, step: i64);

    /// Fetch interpolated values for the given metric identifiers at the
    /// current interpolation position.  Metrics with an index domain yield
    /// one sample per member that has data.
    async fn fetch_interpolated(&mut self, ids: &[MetricId]) -> Result<Vec<Sample>>;
}
