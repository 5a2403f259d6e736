//! Metrics module for the refinement pipeline.
//!
//! Provides a straightforward API for recording metrics using the standard
//! Prometheus naming conventions, with an enum catalog instead of magic
//! strings.

use std::fmt;

/// Enum representing all metric names used in the system
/// This eliminates magic strings and provides compile-time safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Normalizer metrics
    NormalizeRecordsProcessed,
    NormalizeRecordsRejected,

    // Validation metrics
    ValidateRecordsAccepted,
    ValidateRecordsRejected,
    ValidateQualityScore,

    // Deduplication metrics
    DedupeSurvivors,
    DedupeSuperseded,

    // Dimension build metrics
    DimensionRowsInserted,
    DimensionRowsClosed,
    DimensionRowsUnchanged,

    // Fact build metrics
    FactRowsEmitted,
    FactRowsRejected,
    FactReferentialIntegrity,

    // Quality monitor metrics
    QualityLayerScore,
    QualityAlertsRaised,

    // Run metrics
    RunsCompleted,
    RunsFailed,
    RunDurationSeconds,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::NormalizeRecordsProcessed => "dwh_normalize_records_processed_total",
            MetricName::NormalizeRecordsRejected => "dwh_normalize_records_rejected_total",

            MetricName::ValidateRecordsAccepted => "dwh_validate_records_accepted_total",
            MetricName::ValidateRecordsRejected => "dwh_validate_records_rejected_total",
            MetricName::ValidateQualityScore => "dwh_validate_quality_score",

            MetricName::DedupeSurvivors => "dwh_dedupe_survivors_total",
            MetricName::DedupeSuperseded => "dwh_dedupe_superseded_total",

            MetricName::DimensionRowsInserted => "dwh_dimension_rows_inserted_total",
            MetricName::DimensionRowsClosed => "dwh_dimension_rows_closed_total",
            MetricName::DimensionRowsUnchanged => "dwh_dimension_rows_unchanged_total",

            MetricName::FactRowsEmitted => "dwh_fact_rows_emitted_total",
            MetricName::FactRowsRejected => "dwh_fact_rows_rejected_total",
            MetricName::FactReferentialIntegrity => "dwh_fact_referential_integrity",

            MetricName::QualityLayerScore => "dwh_quality_layer_score",
            MetricName::QualityAlertsRaised => "dwh_quality_alerts_raised_total",

            MetricName::RunsCompleted => "dwh_runs_completed_total",
            MetricName::RunsFailed => "dwh_runs_failed_total",
            MetricName::RunDurationSeconds => "dwh_run_duration_seconds",
        }
    }

    /// Get metric metadata for dashboard generation
    /// Returns (phase, description, unit)
    pub fn metadata(&self) -> (&'static str, &'static str, Option<&'static str>) {
        match self {
            MetricName::NormalizeRecordsProcessed => {
                ("normalize", "Records normalized", None)
            }
            MetricName::NormalizeRecordsRejected => {
                ("normalize", "Records rejected as malformed", None)
            }
            MetricName::ValidateRecordsAccepted => {
                ("validate", "Records accepted by rule evaluation", None)
            }
            MetricName::ValidateRecordsRejected => {
                ("validate", "Records rejected by blocking rules", None)
            }
            MetricName::ValidateQualityScore => {
                ("validate", "Per-record quality score", None)
            }
            MetricName::DedupeSurvivors => ("dedupe", "Survivor records per run", None),
            MetricName::DedupeSuperseded => ("dedupe", "Superseded records per run", None),
            MetricName::DimensionRowsInserted => {
                ("dimension", "Dimension row versions inserted", None)
            }
            MetricName::DimensionRowsClosed => {
                ("dimension", "Dimension row versions closed", None)
            }
            MetricName::DimensionRowsUnchanged => {
                ("dimension", "Business keys with no attribute change", None)
            }
            MetricName::FactRowsEmitted => ("fact", "Fact rows emitted", None),
            MetricName::FactRowsRejected => {
                ("fact", "Fact rows rejected on unresolved dimension keys", None)
            }
            MetricName::FactReferentialIntegrity => {
                ("fact", "Share of fact rows with resolved references", None)
            }
            MetricName::QualityLayerScore => ("quality", "Aggregate layer score", None),
            MetricName::QualityAlertsRaised => ("quality", "Alerts raised", None),
            MetricName::RunsCompleted => ("run", "Completed refinement runs", None),
            MetricName::RunsFailed => ("run", "Failed refinement runs", None),
            MetricName::RunDurationSeconds => ("run", "End-to-end run duration", Some("s")),
        }
    }

    /// Get all metric names as an iterator (for dynamic dashboard generation)
    pub fn all_metrics() -> impl Iterator<Item = MetricName> {
        use MetricName::*;
        [
            NormalizeRecordsProcessed,
            NormalizeRecordsRejected,
            ValidateRecordsAccepted,
            ValidateRecordsRejected,
            ValidateQualityScore,
            DedupeSurvivors,
            DedupeSuperseded,
            DimensionRowsInserted,
            DimensionRowsClosed,
            DimensionRowsUnchanged,
            FactRowsEmitted,
            FactRowsRejected,
            FactReferentialIntegrity,
            QualityLayerScore,
            QualityAlertsRaised,
            RunsCompleted,
            RunsFailed,
            RunDurationSeconds,
        ]
        .into_iter()
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub fn emit_counter(name: MetricName, value: f64) {
    ::metrics::counter!(name.as_str()).increment(value as u64);
}

pub fn emit_histogram(name: MetricName, value: f64) {
    ::metrics::histogram!(name.as_str()).record(value);
}

pub fn emit_gauge(name: MetricName, value: f64) {
    ::metrics::gauge!(name.as_str()).set(value);
}

/// Pre-register all metrics so they appear on the exporter before first use.
pub fn init() {
    for name in MetricName::all_metrics() {
        let _ = ::metrics::counter!(name.as_str());
    }
}
