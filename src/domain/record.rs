use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// An operational extract row exactly as delivered by a source system.
///
/// Immutable once captured: every refinement produces a new record in a later
/// layer rather than mutating this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    /// The source system that delivered this record (e.g. "crm", "erp")
    pub source_id: String,
    /// The kind of thing the record describes (e.g. "customer", "sales")
    pub entity: String,
    /// Natural identifier assigned by the source system
    pub business_key: String,
    /// Untyped field map as extracted; values are raw strings
    pub fields: BTreeMap<String, String>,
    /// When the record was extracted from the source
    pub extracted_at: DateTime<Utc>,
}

/// A typed field value after normalization.
///
/// `Absent` is the canonical marker for all source-specific null sentinels
/// (empty strings, placeholder codes). Ordered map keys plus this closed enum
/// give every record a stable canonical serialization, which the deduplicator
/// relies on for its total order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum FieldValue {
    Absent,
    Text(String),
    Code(String),
    Integer(i64),
    Decimal(f64),
    Date(NaiveDate),
}

impl FieldValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, FieldValue::Absent)
    }

    /// The string content of a `Text` or `Code` value, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) | FieldValue::Code(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view of `Integer` and `Decimal` values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => Some(*d),
            _ => None,
        }
    }
}

/// A field map after normalization but before rule evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub source_id: String,
    pub entity: String,
    pub business_key: String,
    /// Typed field values; source null sentinels are already `Absent`
    pub fields: BTreeMap<String, FieldValue>,
    pub extracted_at: DateTime<Utc>,
    pub normalized_at: DateTime<Utc>,
}

/// A validated record in the cleansed layer.
///
/// Created by the validation engine from exactly one raw record and never
/// mutated afterwards; corrections arrive as new versions in later runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleansedRecord {
    pub source_id: String,
    pub entity: String,
    pub business_key: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// True for every record in this layer: a blocking-rule failure leaves on
    /// the reject channel before a `CleansedRecord` exists. Persisted so
    /// downstream stores carry an explicit validity marker per row.
    pub validity: bool,
    /// Severity-weighted share of rules passed, in [0, 1]
    pub quality_score: f64,
    pub extracted_at: DateTime<Utc>,
    pub cleansed_at: DateTime<Utc>,
}

impl CleansedRecord {
    /// Stable serialization of the field map, used as the final tiebreak in
    /// survivor selection so the ordering is total.
    pub fn canonical_fields(&self) -> String {
        serde_json::to_string(&self.fields).unwrap_or_default()
    }
}

/// Why a record was turned away instead of promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    #[serde(rename = "MALFORMED_FIELD")]
    MalformedField,
    #[serde(rename = "BLOCKING_RULE_FAILURE")]
    BlockingRuleFailure,
    #[serde(rename = "UNRESOLVED_DIMENSION_KEY")]
    UnresolvedDimensionKey,
}

/// A rejected record with enough context to investigate or replay it without
/// re-running the whole pipeline. Rejections are emitted on a reject channel,
/// never silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordRejection {
    pub reason: RejectReason,
    pub source_id: String,
    pub entity: String,
    pub business_key: String,
    /// The record's field payload at the point of rejection: raw values as
    /// text for normalization failures, typed values afterwards
    pub fields: BTreeMap<String, FieldValue>,
    /// Names of the failing rules, when rule evaluation caused the rejection
    pub failed_rules: Vec<String>,
    /// Human-readable context (offending field, unresolvable key, ...)
    pub detail: String,
    pub rejected_at: DateTime<Utc>,
}

/// A deduplication loser, kept in the run's audit trail rather than discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupersededRecord {
    pub record: CleansedRecord,
    /// Always "SUPERSEDED"; serialized for downstream audit consumers
    pub tag: String,
    /// Source of the record that won the group
    pub superseded_by_source: String,
    pub decided_at: DateTime<Utc>,
}

impl SupersededRecord {
    pub fn new(record: CleansedRecord, winner_source: &str, decided_at: DateTime<Utc>) -> Self {
        Self {
            record,
            tag: "SUPERSEDED".to_string(),
            superseded_by_source: winner_source.to_string(),
            decided_at,
        }
    }
}
