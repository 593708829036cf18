//! Configuration management for the metricshed service.
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then environment variables prefixed with `METRICSHED_`.  Command-line
//! overrides are applied by the binary on top of the loaded result.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cache::{PrefixSource, RefreshConfig};
use crate::codec::EncodingMode;
use crate::error::Result;
use crate::fetch::{FetchConfig, DEFAULT_MAX_POINTS};

/// Archive discovery and naming configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveSettings {
    /// Root directory scanned for archives.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Name-segment escape style.
    #[serde(default)]
    pub encoding: EncodingMode,
    /// Where archive name prefixes come from.
    #[serde(default)]
    pub prefix_source: PrefixSource,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            root: default_root(),
            encoding: EncodingMode::default(),
            prefix_source: PrefixSource::default(),
        }
    }
}

/// Cache refresh tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Minimum seconds between full rescans.
    #[serde(default = "default_min_refresh_interval")]
    pub min_refresh_interval_secs: i64,
    /// Fraction of observed quiescence an entry is assumed fresh for.
    #[serde(default = "default_freshness_ratio")]
    pub freshness_ratio: f64,
    /// Seconds between cache statistics reports; 0 disables.
    #[serde(default)]
    pub stats_interval_secs: i64,
}

fn default_min_refresh_interval() -> i64 {
    60
}

fn default_freshness_ratio() -> f64 {
    0.5
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            min_refresh_interval_secs: default_min_refresh_interval(),
            freshness_ratio: default_freshness_ratio(),
            stats_interval_secs: 0,
        }
    }
}

/// Fetch-engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSettings {
    /// Worker-pool size for concurrent per-archive fetches.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Base sampling step in seconds.
    #[serde(default = "default_base_step")]
    pub base_step_secs: i64,
    /// Default cap on returned points per series.
    #[serde(default = "default_max_points")]
    pub max_points: usize,
}

fn default_workers() -> usize {
    num_cpus::get()
}

fn default_base_step() -> i64 {
    60
}

fn default_max_points() -> usize {
    DEFAULT_MAX_POINTS
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            base_step_secs: default_base_step(),
            max_points: default_max_points(),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub archives: ArchiveSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub fetch: FetchSettings,
}

impl ServiceConfig {
    /// Load configuration from the optional file path plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path.to_path_buf()));
        }
        let settings = builder
            .add_source(Environment::with_prefix("METRICSHED").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// The refresh policy view of this configuration.
    pub fn refresh_config(&self) -> RefreshConfig {
        RefreshConfig {
            archive_root: self.archives.root.clone(),
            min_refresh_interval: self.cache.min_refresh_interval_secs,
            freshness_ratio: self.cache.freshness_ratio,
            encoding: self.archives.encoding,
            prefix_source: self.archives.prefix_source,
            stats_interval: self.cache.stats_interval_secs,
        }
    }

    /// The fetch-engine view of this configuration.
    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            workers: self.fetch.workers.max(1),
            base_step: self.fetch.base_step_secs.max(1),
            encoding: self.archives.encoding,
        }
    }
}
