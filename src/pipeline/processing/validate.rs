use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::config::{RuleCheck, RuleSeverity, RunConfig, ValidationRule};
use crate::domain::{
    CleansedRecord, FieldValue, NormalizedRecord, RecordRejection, RejectReason,
};

/// Relative weight of each severity in the quality score.
fn severity_weight(severity: RuleSeverity) -> f64 {
    match severity {
        RuleSeverity::Blocking => 1.0,
        RuleSeverity::Warning => 0.5,
    }
}

/// Compiled regexes are cached across records; rule sets are small and fixed
/// for the duration of a run.
static REGEX_CACHE: Lazy<Mutex<HashMap<String, Regex>>> = Lazy::new(Default::default);

fn cached_regex(pattern: &str) -> Option<Regex> {
    let mut cache = REGEX_CACHE.lock().expect("regex cache poisoned");
    if let Some(re) = cache.get(pattern) {
        return Some(re.clone());
    }
    match Regex::new(pattern) {
        Ok(re) => {
            cache.insert(pattern.to_string(), re.clone());
            Some(re)
        }
        Err(e) => {
            warn!("invalid rule pattern `{}`: {}", pattern, e);
            None
        }
    }
}

/// The evaluation of one rule against one record.
#[derive(Debug, Clone)]
pub struct RuleResult {
    pub name: String,
    pub severity: RuleSeverity,
    pub passed: bool,
}

/// What became of a record after rule evaluation.
#[derive(Debug, Clone)]
pub enum Verdict {
    Accepted(CleansedRecord),
    Rejected(RecordRejection),
}

/// The full outcome: the verdict plus per-rule results for quality reporting.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub verdict: Verdict,
    pub rule_results: Vec<RuleResult>,
}

/// Rule-based record acceptance with quality scoring.
///
/// Rules are data: the engine evaluates every check uniformly and knows
/// nothing about any particular rule set. A record is valid only if all
/// blocking rules pass; warning failures lower the score but let the record
/// proceed. Blocking failures emit the record on the reject channel with the
/// failing rule names.
pub struct ValidationEngine {
    /// Rule sets keyed by "{source}/{entity}"
    rule_sets: BTreeMap<String, Vec<ValidationRule>>,
}

impl ValidationEngine {
    pub fn new(rule_sets: BTreeMap<String, Vec<ValidationRule>>) -> Self {
        Self { rule_sets }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.rule_sets.clone())
    }

    pub fn validate(&self, record: &NormalizedRecord) -> ValidationOutcome {
        let key = RunConfig::schema_key(&record.source_id, &record.entity);
        let rules = self.rule_sets.get(&key).map(Vec::as_slice).unwrap_or(&[]);

        let mut rule_results = Vec::with_capacity(rules.len());
        let mut passed_weight = 0.0;
        let mut total_weight = 0.0;
        let mut blocking_failures = Vec::new();

        for rule in rules {
            let passed = evaluate_check(&rule.check, record);
            let weight = severity_weight(rule.severity);
            total_weight += weight;
            if passed {
                passed_weight += weight;
            } else if rule.severity == RuleSeverity::Blocking {
                blocking_failures.push(rule.name.clone());
            }
            rule_results.push(RuleResult {
                name: rule.name.clone(),
                severity: rule.severity,
                passed,
            });
        }

        let quality_score = if total_weight > 0.0 {
            passed_weight / total_weight
        } else {
            1.0
        };

        let verdict = if blocking_failures.is_empty() {
            Verdict::Accepted(CleansedRecord {
                source_id: record.source_id.clone(),
                entity: record.entity.clone(),
                business_key: record.business_key.clone(),
                fields: record.fields.clone(),
                validity: true,
                quality_score,
                extracted_at: record.extracted_at,
                cleansed_at: Utc::now(),
            })
        } else {
            Verdict::Rejected(RecordRejection {
                reason: RejectReason::BlockingRuleFailure,
                source_id: record.source_id.clone(),
                entity: record.entity.clone(),
                business_key: record.business_key.clone(),
                fields: record.fields.clone(),
                failed_rules: blocking_failures,
                detail: format!("quality score {:.3}", quality_score),
                rejected_at: Utc::now(),
            })
        };

        ValidationOutcome {
            verdict,
            rule_results,
        }
    }
}

fn field<'a>(record: &'a NormalizedRecord, name: &str) -> Option<&'a FieldValue> {
    record.fields.get(name).filter(|v| !v.is_absent())
}

fn evaluate_check(check: &RuleCheck, record: &NormalizedRecord) -> bool {
    match check {
        RuleCheck::RequiredField { field: name } => field(record, name).is_some(),
        RuleCheck::DomainMembership {
            field: name,
            allowed,
        } => match field(record, name) {
            Some(value) => value
                .as_str()
                .map(|s| allowed.iter().any(|a| a == s))
                .unwrap_or(false),
            // Absence is a presence concern, not a domain violation
            None => true,
        },
        RuleCheck::NonNegative { field: name } => match field(record, name) {
            Some(value) => value.as_f64().map(|n| n >= 0.0).unwrap_or(false),
            None => true,
        },
        RuleCheck::NumericRange {
            field: name,
            min,
            max,
        } => match field(record, name) {
            Some(value) => value
                .as_f64()
                .map(|n| n >= *min && n <= *max)
                .unwrap_or(false),
            None => true,
        },
        RuleCheck::PatternMatch {
            field: name,
            pattern,
        } => match field(record, name) {
            Some(value) => match (value.as_str(), cached_regex(pattern)) {
                (Some(s), Some(re)) => re.is_match(s),
                _ => false,
            },
            None => true,
        },
        RuleCheck::KeyPattern { pattern } => cached_regex(pattern)
            .map(|re| re.is_match(&record.business_key))
            .unwrap_or(false),
        RuleCheck::DateRange {
            field: name,
            earliest,
            allow_future,
        } => match field(record, name) {
            Some(value) => match value.as_date() {
                Some(date) => {
                    let after_floor = earliest.map(|e| date >= e).unwrap_or(true);
                    let not_future = *allow_future || date <= Utc::now().date_naive();
                    after_floor && not_future
                }
                None => false,
            },
            None => true,
        },
    }
}
