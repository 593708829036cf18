//! Archive backend contract and the descriptor model shared with it.
//!
//! An archive is a bounded-time-range, append-only store of historical
//! instrumented values.  The cache and the fetch engine are generic over the
//! [`ArchiveBackend`] trait; `fs` provides the bundled on-disk reference
//! backend.

pub mod backend;
pub mod fs;

pub use backend::{ArchiveBackend, ArchiveHandle};
pub use fs::FsBackend;

use serde::{Deserialize, Serialize};

/// Opaque identifier for reopening an archive; a filesystem path in the
/// reference backend.
pub type StorageId = String;

/// Numeric identifier of a metric within one archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricId(pub u32);

/// Identifier of a value-index domain within one archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainId(pub u32);

/// Identifier of one member within a value-index domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(pub u32);

/// Storage type of an instrumented value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// Free-form text; not chartable.
    Text,
    /// Aggregates, event records and other opaque payloads.
    Other,
}

impl ValueType {
    pub fn is_numeric(self) -> bool {
        !matches!(self, ValueType::Text | ValueType::Other)
    }
}

/// Semantics of an instrumented value over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Semantics {
    /// Monotonically increasing; rate-converted before presentation.
    Counter,
    /// Point-in-time sample.
    Instant,
    /// Changes only at discrete reconfiguration events.
    Discrete,
}

/// Descriptor of one metric as reported by an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDesc {
    pub value_type: ValueType,
    pub semantics: Semantics,
    /// The value-index domain this metric reports over, if any.
    pub domain: Option<DomainId>,
}

impl MetricDesc {
    /// The fixed synthetic descriptor published for the `"_"` coverage
    /// pseudo-metric, which involves no archive I/O.
    pub fn coverage() -> Self {
        Self {
            value_type: ValueType::F64,
            semantics: Semantics::Instant,
            domain: None,
        }
    }
}

/// One value returned by an interpolated fetch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub id: MetricId,
    /// The index-domain member this value belongs to; None for metrics
    /// without a domain.
    pub member: Option<MemberId>,
    pub value: f64,
}
