use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::record::FieldValue;

/// System-generated identifier for one version of a dimension row.
///
/// Monotonic within a dimension and never reused, even for business keys that
/// disappear and later reappear. Facts reference these, never business keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SurrogateKey(pub u64);

impl std::fmt::Display for SurrogateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One version of a dimension member (Type-2 slowly changing dimension).
///
/// Multiple rows may share a business key; at most one of them is current at
/// any time. That is the core invariant of historical tracking and is checked
/// after every dimension build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionRow {
    pub surrogate_key: SurrogateKey,
    /// The dimension this row belongs to (e.g. "dim_customers")
    pub dimension: String,
    pub business_key: String,
    /// Merged, conformed attribute set for this version
    pub attributes: BTreeMap<String, FieldValue>,
    pub effective_from: DateTime<Utc>,
    /// Set when a newer version closes this one
    pub effective_to: Option<DateTime<Utc>>,
    pub is_current: bool,
}

/// The staged outcome of one dimension build, applied atomically.
///
/// `closed` carries prior current rows with `effective_to` set and
/// `is_current` cleared; `inserted` carries the fresh current versions.
/// Nothing is visible to the fact builder until the whole delta commits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DimensionDelta {
    pub dimension: String,
    pub closed: Vec<DimensionRow>,
    pub inserted: Vec<DimensionRow>,
}

impl DimensionDelta {
    pub fn new(dimension: &str) -> Self {
        Self {
            dimension: dimension.to_string(),
            closed: Vec::new(),
            inserted: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.closed.is_empty() && self.inserted.is_empty()
    }
}

/// A star-schema fact referencing dimension surrogate keys plus measures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactRow {
    /// The fact stream this row belongs to (e.g. "fact_sales")
    pub fact: String,
    /// Business key of the transactional record (e.g. order number)
    pub business_key: String,
    /// Resolved dimension references, keyed by dimension name
    pub dimension_refs: BTreeMap<String, SurrogateKey>,
    /// Numeric measures (quantities, amounts)
    pub measures: BTreeMap<String, f64>,
    pub transaction_at: DateTime<Utc>,
}
