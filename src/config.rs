//! Run configuration consumed, not owned, by the core.
//!
//! Rule sets, schemas, source priority, thresholds, and limits are supplied
//! externally (TOML in practice) and treated as immutable inputs for a run.
//! Loading the file itself is the caller's concern.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Declared type for a source field; drives coercion in the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Code,
    Integer,
    Decimal,
    Date,
}

/// Per-source, per-entity field declaration used by the normalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSchema {
    /// Declared field types; undeclared fields pass through as text
    pub field_types: BTreeMap<String, FieldType>,
    /// Source-specific null markers mapped to the canonical absent value
    pub null_sentinels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSeverity {
    /// Failure rejects the record
    Blocking,
    /// Failure lowers the quality score but the record proceeds
    Warning,
}

/// Declarative predicate evaluated uniformly by the validation engine.
///
/// Rules are data: new checks are added by extending a rule set, never by
/// touching engine code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum RuleCheck {
    /// Field must be present (not `Absent`, not missing)
    RequiredField { field: String },
    /// Field value must be one of the allowed codes
    DomainMembership { field: String, allowed: Vec<String> },
    /// Numeric field must be >= 0; absent fields are not negative
    NonNegative { field: String },
    /// Numeric field must fall inside the closed interval
    NumericRange { field: String, min: f64, max: f64 },
    /// Text/code field must match the regex
    PatternMatch { field: String, pattern: String },
    /// The record's business key must match the regex
    KeyPattern { pattern: String },
    /// Date field must be at or after `earliest` and, unless allowed, not in
    /// the future relative to the run timestamp
    DateRange {
        field: String,
        earliest: Option<NaiveDate>,
        allow_future: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRule {
    pub name: String,
    pub severity: RuleSeverity,
    #[serde(flatten)]
    pub check: RuleCheck,
}

/// Whether duplicate business keys are collapsed within each source or across
/// sources. Dimension builds that merge constituent sources per key expect
/// per-source survivors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeScope {
    PerSource,
    CrossSource,
}

/// One dimension and the sources that feed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionSpec {
    /// Dimension name, e.g. "dim_customers"
    pub name: String,
    /// Entity whose cleansed records feed this dimension
    pub entity: String,
    /// Constituent sources in merge-precedence order: a later-listed source's
    /// value wins on conflicting attributes. Absent values never overwrite a
    /// present one.
    pub constituents: Vec<String>,
}

/// A foreign-key reference from a fact to a dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionRef {
    pub dimension: String,
    /// Field in the transactional record holding the foreign business key
    pub key_field: String,
}

/// One fact stream and how to assemble it from transactional records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactSpec {
    /// Fact name, e.g. "fact_sales"
    pub name: String,
    /// Entity of the transactional records, e.g. "sales"
    pub entity: String,
    pub dimension_refs: Vec<DimensionRef>,
    /// Fields carried over as numeric measures
    pub measures: Vec<String>,
    /// Date field supplying the transaction timestamp
    pub timestamp_field: String,
}

/// Floors and ceilings evaluated by the quality monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Minimum aggregate score per layer
    pub min_layer_score: f64,
    /// Absolute ceiling on rejected records per layer
    pub max_rejections: u64,
    /// Relative ceiling: rejected / records_in
    pub max_rejection_ratio: f64,
    /// Cleansed layer must retain at least this share of raw input
    pub min_retention_ratio: f64,
    /// Minimum share of fact rows with fully resolved dimension references
    pub min_referential_integrity: f64,
}

/// Bounded retry with exponential backoff for external reads/writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

/// Resource limits for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    /// Upper bound on concurrent per-record workers within a stage
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

/// Everything a single refinement run needs, immutable for its duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Source systems in survivor-priority order, best first
    pub source_priority: Vec<String>,
    /// Schemas keyed by "{source}/{entity}"
    pub schemas: BTreeMap<String, SourceSchema>,
    /// Validation rule sets keyed by "{source}/{entity}"
    pub rule_sets: BTreeMap<String, Vec<ValidationRule>>,
    pub dedupe_scope: DedupeScope,
    pub dimensions: Vec<DimensionSpec>,
    pub facts: Vec<FactSpec>,
    pub thresholds: QualityThresholds,
    pub limits: Limits,
}

impl RunConfig {
    /// Priority rank of a source; unknown sources sort after configured ones.
    pub fn source_rank(&self, source_id: &str) -> usize {
        self.source_priority
            .iter()
            .position(|s| s == source_id)
            .unwrap_or(self.source_priority.len())
    }

    pub fn schema_key(source_id: &str, entity: &str) -> String {
        format!("{}/{}", source_id, entity)
    }
}

/// The CRM + ERP warehouse profile shipped with the original pipeline:
/// customer and product dimensions fed by both systems, sales facts from CRM.
/// ERP outranks CRM for conflict resolution and merge precedence.
pub fn warehouse_profile() -> RunConfig {
    let null_sentinels = ["", "n/a", "N/A", "NULL", "-", "unknown"]
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>();

    let mut schemas = BTreeMap::new();
    schemas.insert(
        "crm/customer".to_string(),
        SourceSchema {
            field_types: BTreeMap::from([
                ("first_name".to_string(), FieldType::Text),
                ("last_name".to_string(), FieldType::Text),
                ("marital_status".to_string(), FieldType::Code),
                ("gender".to_string(), FieldType::Code),
                ("create_date".to_string(), FieldType::Date),
            ]),
            null_sentinels: null_sentinels.clone(),
        },
    );
    schemas.insert(
        "erp/customer".to_string(),
        SourceSchema {
            field_types: BTreeMap::from([
                ("birth_date".to_string(), FieldType::Date),
                ("gender".to_string(), FieldType::Code),
                ("country".to_string(), FieldType::Code),
            ]),
            null_sentinels: null_sentinels.clone(),
        },
    );
    schemas.insert(
        "crm/product".to_string(),
        SourceSchema {
            field_types: BTreeMap::from([
                ("product_name".to_string(), FieldType::Text),
                ("cost".to_string(), FieldType::Decimal),
                ("product_line".to_string(), FieldType::Code),
                ("start_date".to_string(), FieldType::Date),
            ]),
            null_sentinels: null_sentinels.clone(),
        },
    );
    schemas.insert(
        "erp/product".to_string(),
        SourceSchema {
            field_types: BTreeMap::from([
                ("category".to_string(), FieldType::Text),
                ("subcategory".to_string(), FieldType::Text),
                ("maintenance".to_string(), FieldType::Code),
            ]),
            null_sentinels: null_sentinels.clone(),
        },
    );
    schemas.insert(
        "crm/sales".to_string(),
        SourceSchema {
            field_types: BTreeMap::from([
                ("customer_key".to_string(), FieldType::Code),
                ("product_key".to_string(), FieldType::Code),
                ("order_date".to_string(), FieldType::Date),
                ("quantity".to_string(), FieldType::Integer),
                ("price".to_string(), FieldType::Decimal),
                ("amount".to_string(), FieldType::Decimal),
            ]),
            null_sentinels,
        },
    );

    let mut rule_sets = BTreeMap::new();
    rule_sets.insert(
        "crm/customer".to_string(),
        vec![
            ValidationRule {
                name: "customer_key_format".to_string(),
                severity: RuleSeverity::Blocking,
                check: RuleCheck::KeyPattern {
                    pattern: "^C[0-9]+$".to_string(),
                },
            },
            ValidationRule {
                name: "first_name_present".to_string(),
                severity: RuleSeverity::Warning,
                check: RuleCheck::RequiredField {
                    field: "first_name".to_string(),
                },
            },
            ValidationRule {
                name: "marital_status_domain".to_string(),
                severity: RuleSeverity::Warning,
                check: RuleCheck::DomainMembership {
                    field: "marital_status".to_string(),
                    allowed: vec!["S".to_string(), "M".to_string()],
                },
            },
        ],
    );
    rule_sets.insert(
        "erp/customer".to_string(),
        vec![
            ValidationRule {
                name: "customer_key_format".to_string(),
                severity: RuleSeverity::Blocking,
                check: RuleCheck::KeyPattern {
                    pattern: "^C[0-9]+$".to_string(),
                },
            },
            ValidationRule {
                name: "country_domain".to_string(),
                severity: RuleSeverity::Warning,
                check: RuleCheck::DomainMembership {
                    field: "country".to_string(),
                    allowed: vec![
                        "US".to_string(),
                        "CA".to_string(),
                        "DE".to_string(),
                        "FR".to_string(),
                        "GB".to_string(),
                        "AU".to_string(),
                    ],
                },
            },
            ValidationRule {
                name: "birth_date_sane".to_string(),
                severity: RuleSeverity::Warning,
                check: RuleCheck::DateRange {
                    field: "birth_date".to_string(),
                    earliest: NaiveDate::from_ymd_opt(1900, 1, 1),
                    allow_future: false,
                },
            },
        ],
    );
    rule_sets.insert(
        "crm/product".to_string(),
        vec![
            ValidationRule {
                name: "product_key_format".to_string(),
                severity: RuleSeverity::Blocking,
                check: RuleCheck::KeyPattern {
                    pattern: "^P[0-9]+$".to_string(),
                },
            },
            ValidationRule {
                name: "cost_non_negative".to_string(),
                severity: RuleSeverity::Blocking,
                check: RuleCheck::NonNegative {
                    field: "cost".to_string(),
                },
            },
        ],
    );
    rule_sets.insert(
        "erp/product".to_string(),
        vec![ValidationRule {
            name: "product_key_format".to_string(),
            severity: RuleSeverity::Blocking,
            check: RuleCheck::KeyPattern {
                pattern: "^P[0-9]+$".to_string(),
            },
        }],
    );
    rule_sets.insert(
        "crm/sales".to_string(),
        vec![
            ValidationRule {
                name: "customer_ref_present".to_string(),
                severity: RuleSeverity::Blocking,
                check: RuleCheck::RequiredField {
                    field: "customer_key".to_string(),
                },
            },
            ValidationRule {
                name: "product_ref_present".to_string(),
                severity: RuleSeverity::Blocking,
                check: RuleCheck::RequiredField {
                    field: "product_key".to_string(),
                },
            },
            ValidationRule {
                name: "quantity_non_negative".to_string(),
                severity: RuleSeverity::Blocking,
                check: RuleCheck::NonNegative {
                    field: "quantity".to_string(),
                },
            },
            ValidationRule {
                name: "amount_non_negative".to_string(),
                severity: RuleSeverity::Blocking,
                check: RuleCheck::NonNegative {
                    field: "amount".to_string(),
                },
            },
            ValidationRule {
                name: "order_date_sane".to_string(),
                severity: RuleSeverity::Warning,
                check: RuleCheck::DateRange {
                    field: "order_date".to_string(),
                    earliest: NaiveDate::from_ymd_opt(2000, 1, 1),
                    allow_future: false,
                },
            },
        ],
    );

    RunConfig {
        source_priority: vec!["erp".to_string(), "crm".to_string()],
        schemas,
        rule_sets,
        dedupe_scope: DedupeScope::PerSource,
        dimensions: vec![
            DimensionSpec {
                name: "dim_customers".to_string(),
                entity: "customer".to_string(),
                // erp listed last so its values win conflicting attributes
                constituents: vec!["crm".to_string(), "erp".to_string()],
            },
            DimensionSpec {
                name: "dim_products".to_string(),
                entity: "product".to_string(),
                constituents: vec!["crm".to_string(), "erp".to_string()],
            },
        ],
        facts: vec![FactSpec {
            name: "fact_sales".to_string(),
            entity: "sales".to_string(),
            dimension_refs: vec![
                DimensionRef {
                    dimension: "dim_customers".to_string(),
                    key_field: "customer_key".to_string(),
                },
                DimensionRef {
                    dimension: "dim_products".to_string(),
                    key_field: "product_key".to_string(),
                },
            ],
            measures: vec!["quantity".to_string(), "amount".to_string()],
            timestamp_field: "order_date".to_string(),
        }],
        thresholds: QualityThresholds {
            min_layer_score: 0.95,
            max_rejections: 1_000,
            max_rejection_ratio: 0.20,
            min_retention_ratio: 0.80,
            min_referential_integrity: 0.95,
        },
        limits: Limits {
            concurrency: 8,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 50,
            },
        },
    }
}
