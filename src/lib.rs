//! Core library for graphite-style metric queries over append-only
//! time-series archives.
//!
//! This crate provides the core functionality for:
//! - A reversible metric-name codec shared by all components
//! - An archive metadata cache with stat-driven freshness and eviction
//! - Pattern-based metric-name enumeration against the cache
//! - A concurrent multi-archive fetch engine with time alignment and rate
//!   conversion

pub mod archive;
pub mod cache;
pub mod codec;
pub mod config;
pub mod enumerate;
pub mod error;
pub mod fetch;
pub mod name;
pub mod series;
pub mod shutdown;
pub mod timespec;

pub use archive::{ArchiveBackend, ArchiveHandle, FsBackend, MetricDesc, Semantics, ValueType};
pub use cache::{
    ArchiveCache, ArchiveEntry, CacheRefresher, Clock, PrefixSource, RefreshConfig, SystemClock,
};
pub use codec::EncodingMode;
pub use config::ServiceConfig;
pub use enumerate::MetricEnumerator;
pub use error::{Error, Result};
pub use fetch::{FetchConfig, FetchScheduler, GatheredQuery};
pub use name::{MetricName, COVERAGE_METRIC};
pub use series::TimeSeries;
pub use shutdown::Shutdown;
pub use timespec::parse_timespec;
