use std::collections::BTreeMap;

use chrono::{NaiveDate, Utc};

use crate::config::{FieldType, RunConfig, SourceSchema};
use crate::domain::{FieldValue, NormalizedRecord, RawRecord, RecordRejection, RejectReason};

/// Trait for normalizing raw extracts into typed field maps.
///
/// Normalization is a pure function: it either yields a normalized record or
/// a `MALFORMED_FIELD` rejection, never a fatal error and never a side effect.
pub trait Normalizer: Send + Sync {
    fn normalize(&self, record: &RawRecord) -> Result<NormalizedRecord, RecordRejection>;
}

/// Default normalizer driven by declared per-source schemas.
///
/// Trims whitespace, maps source null sentinels to `FieldValue::Absent`, and
/// coerces declared types. Fields with no declaration pass through as text.
pub struct SchemaNormalizer {
    schemas: BTreeMap<String, SourceSchema>,
}

impl SchemaNormalizer {
    pub fn new(schemas: BTreeMap<String, SourceSchema>) -> Self {
        Self { schemas }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.schemas.clone())
    }

    fn coerce(
        declared: FieldType,
        trimmed: &str,
    ) -> Result<FieldValue, String> {
        match declared {
            FieldType::Text => Ok(FieldValue::Text(trimmed.to_string())),
            FieldType::Code => Ok(FieldValue::Code(trimmed.to_uppercase())),
            FieldType::Integer => trimmed
                .parse::<i64>()
                .map(FieldValue::Integer)
                .map_err(|e| format!("not an integer: {}", e)),
            FieldType::Decimal => trimmed
                .parse::<f64>()
                .ok()
                .filter(|d| d.is_finite())
                .map(FieldValue::Decimal)
                .ok_or_else(|| "not a finite decimal".to_string()),
            FieldType::Date => NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .or_else(|_| NaiveDate::parse_from_str(trimmed, "%m/%d/%Y"))
                .or_else(|_| NaiveDate::parse_from_str(trimmed, "%Y%m%d"))
                .map(FieldValue::Date)
                .map_err(|_| "unparseable date".to_string()),
        }
    }

    fn reject(record: &RawRecord, field: &str, detail: String) -> RecordRejection {
        RecordRejection {
            reason: RejectReason::MalformedField,
            source_id: record.source_id.clone(),
            entity: record.entity.clone(),
            business_key: record.business_key.clone(),
            // Raw payload travels with the rejection so it can be replayed
            fields: record
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), FieldValue::Text(v.clone())))
                .collect(),
            failed_rules: Vec::new(),
            detail: format!("field `{}`: {}", field, detail),
            rejected_at: Utc::now(),
        }
    }
}

impl Normalizer for SchemaNormalizer {
    fn normalize(&self, record: &RawRecord) -> Result<NormalizedRecord, RecordRejection> {
        let schema_key = RunConfig::schema_key(&record.source_id, &record.entity);
        let schema = self.schemas.get(&schema_key).ok_or_else(|| {
            Self::reject(
                record,
                "<schema>",
                format!("no schema declared for `{}`", schema_key),
            )
        })?;

        let business_key = record.business_key.trim().to_string();
        if business_key.is_empty() {
            return Err(Self::reject(
                record,
                "<business_key>",
                "business key is empty".to_string(),
            ));
        }

        let mut fields = BTreeMap::new();
        for (name, raw_value) in &record.fields {
            let trimmed = raw_value.trim();
            let is_sentinel = schema
                .null_sentinels
                .iter()
                .any(|s| s.eq_ignore_ascii_case(trimmed));

            let value = if is_sentinel {
                FieldValue::Absent
            } else {
                match schema.field_types.get(name) {
                    Some(declared) => Self::coerce(*declared, trimmed)
                        .map_err(|detail| Self::reject(record, name, detail))?,
                    None => FieldValue::Text(trimmed.to_string()),
                }
            };
            fields.insert(name.clone(), value);
        }

        // Declared fields the extract omitted entirely are still absent
        for name in schema.field_types.keys() {
            fields.entry(name.clone()).or_insert(FieldValue::Absent);
        }

        Ok(NormalizedRecord {
            source_id: record.source_id.clone(),
            entity: record.entity.clone(),
            business_key,
            fields,
            extracted_at: record.extracted_at,
            normalized_at: Utc::now(),
        })
    }
}
