use async_trait::async_trait;

use crate::domain::{
    DimensionDelta, DimensionRow, FactRow, QualityAlert, QualitySnapshot, RecordRejection,
    SurrogateKey,
};

/// Upstream ingestion collaborator: delivers immutable raw batches per source.
/// `None` marks the end of the extraction window for that source.
#[async_trait]
pub trait BatchSourcePort: Send + Sync {
    async fn next_batch(
        &self,
        source_id: &str,
    ) -> Result<Option<Vec<crate::domain::RawRecord>>, String>;
}

/// Downstream dimensional store: surrogate-keyed upserts plus reads of the
/// current dimension state.
#[async_trait]
pub trait DimensionStorePort: Send + Sync {
    /// The currently-active row for a business key, if any
    async fn current_row(
        &self,
        dimension: &str,
        business_key: &str,
    ) -> Result<Option<DimensionRow>, String>;

    /// Allocate the next surrogate key. Monotonic across runs; never reused.
    async fn next_surrogate_key(&self, dimension: &str) -> Result<SurrogateKey, String>;

    /// Publish one run's staged dimension builds atomically: either every
    /// close and insert across all deltas becomes visible, or none of it
    /// does. A failed run must not leave a partial stage behind.
    async fn apply_deltas(&self, deltas: &[DimensionDelta]) -> Result<(), String>;

    /// All rows of a dimension, used for post-build invariant checks
    async fn all_rows(&self, dimension: &str) -> Result<Vec<DimensionRow>, String>;

    /// Publish a completed fact batch
    async fn upsert_facts(&self, fact: &str, rows: &[FactRow]) -> Result<(), String>;
}

/// Quality/monitoring collaborator. The core decides what to raise; routing
/// and display belong to the other side of this port.
#[async_trait]
pub trait QualitySinkPort: Send + Sync {
    async fn publish_snapshot(&self, snapshot: &QualitySnapshot) -> Result<(), String>;
    async fn raise_alert(&self, alert: &QualityAlert) -> Result<(), String>;
}

/// Reject channel: every turned-away record lands here with enough context to
/// replay or investigate without re-running the pipeline.
#[async_trait]
pub trait RejectSinkPort: Send + Sync {
    async fn record_rejection(&self, rejection: &RecordRejection) -> Result<(), String>;
}
