use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Refinement layers of the warehouse (bronze/silver/gold in the source
/// system's terminology).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layer {
    Raw,
    Cleansed,
    Dimensional,
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Layer::Raw => "raw",
            Layer::Cleansed => "cleansed",
            Layer::Dimensional => "dimensional",
        };
        write!(f, "{}", name)
    }
}

/// Pass/fail tally for one named validation rule over a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub rule: String,
    pub passed: u64,
    pub failed: u64,
}

/// Point-in-time quality record for one layer of one run.
///
/// Append-only: snapshots are never mutated once taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualitySnapshot {
    pub run_id: Uuid,
    pub layer: Layer,
    pub taken_at: DateTime<Utc>,
    /// Records entering the layer this run
    pub records_in: u64,
    /// Records the layer promoted
    pub records_out: u64,
    /// Records rejected while building the layer
    pub rejected: u64,
    pub rule_outcomes: Vec<RuleOutcome>,
    /// Aggregate quality score for the layer, in [0, 1]
    pub aggregate_score: f64,
    /// records_out / records_in for the cleansed layer
    pub retention_ratio: Option<f64>,
    /// Share of fact rows whose dimension references resolved
    pub referential_integrity: Option<f64>,
}

/// Which configured ceiling or floor a layer breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertCondition {
    ScoreBelowThreshold,
    RejectionCountCeiling,
    RejectionRatioCeiling,
    RetentionBelowFloor,
    ReferentialIntegrityBelowFloor,
}

/// An alert decision. Delivery (paging, dashboards) belongs to the external
/// monitoring collaborator; the monitor only decides whether to raise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityAlert {
    pub run_id: Uuid,
    pub layer: Layer,
    pub condition: AlertCondition,
    pub observed: f64,
    pub threshold: f64,
    pub raised_at: DateTime<Utc>,
}
