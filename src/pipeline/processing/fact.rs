use std::collections::BTreeMap;

use chrono::{DateTime, NaiveTime, Utc};
use tracing::{info, warn};

use crate::app::ports::DimensionStorePort;
use crate::config::{FactSpec, RetryPolicy};
use crate::domain::{
    CleansedRecord, FactRow, FieldValue, RecordRejection, RejectReason, SurrogateKey,
};
use crate::error::{RefineryError, Result};
use crate::infra::retry::with_backoff;

/// Outcome of one fact build: emitted rows plus the rejects that could not be
/// resolved against the dimensions.
#[derive(Debug, Clone, Default)]
pub struct FactBuildOutcome {
    pub rows: Vec<FactRow>,
    pub rejections: Vec<RecordRejection>,
}

impl FactBuildOutcome {
    /// Share of input rows whose dimension references all resolved.
    pub fn referential_integrity(&self) -> f64 {
        let total = self.rows.len() + self.rejections.len();
        if total == 0 {
            return 1.0;
        }
        self.rows.len() as f64 / total as f64
    }
}

/// Joins cleansed transactional records against current dimension rows,
/// resolving foreign business keys to surrogate keys.
///
/// Resolution happens at build time: late-arriving dimension changes are not
/// retroactively applied to historical facts. A record whose reference cannot
/// be resolved is rejected with `UNRESOLVED_DIMENSION_KEY` and logged, never
/// silently dropped or defaulted.
pub struct FactBuilder<'a> {
    spec: &'a FactSpec,
    retry: &'a RetryPolicy,
}

impl<'a> FactBuilder<'a> {
    pub fn new(spec: &'a FactSpec, retry: &'a RetryPolicy) -> Self {
        Self { spec, retry }
    }

    /// Extract and sanity-check the measures. Invalid measures were already
    /// caught upstream by validation; one reaching this stage means the
    /// engine's own contract broke, which is fatal.
    fn measures(&self, record: &CleansedRecord) -> Result<BTreeMap<String, f64>> {
        let mut measures = BTreeMap::new();
        for name in &self.spec.measures {
            match record.fields.get(name) {
                Some(value) if value.is_absent() => {}
                Some(value) => {
                    let number = value.as_f64().ok_or_else(|| {
                        RefineryError::InvariantViolation(format!(
                            "non-numeric measure `{}` on {} record `{}` reached the fact builder",
                            name, record.source_id, record.business_key
                        ))
                    })?;
                    if !number.is_finite() || number < 0.0 {
                        return Err(RefineryError::InvariantViolation(format!(
                            "measure `{}` = {} on record `{}` escaped upstream validation",
                            name, number, record.business_key
                        )));
                    }
                    measures.insert(name.clone(), number);
                }
                None => {}
            }
        }
        Ok(measures)
    }

    fn transaction_at(&self, record: &CleansedRecord) -> DateTime<Utc> {
        record
            .fields
            .get(&self.spec.timestamp_field)
            .and_then(FieldValue::as_date)
            .and_then(|d| d.and_time(NaiveTime::MIN).and_local_timezone(Utc).single())
            .unwrap_or(record.extracted_at)
    }

    /// Build the fact stream and publish it atomically on completion.
    pub async fn build(
        &self,
        records: &[CleansedRecord],
        store: &dyn DimensionStorePort,
    ) -> Result<FactBuildOutcome> {
        let mut outcome = FactBuildOutcome::default();

        'records: for record in records {
            if record.entity != self.spec.entity {
                continue;
            }

            let measures = self.measures(record)?;
            let mut dimension_refs: BTreeMap<String, SurrogateKey> = BTreeMap::new();

            for dim_ref in &self.spec.dimension_refs {
                let foreign_key = match record
                    .fields
                    .get(&dim_ref.key_field)
                    .and_then(FieldValue::as_str)
                {
                    Some(key) => key.to_string(),
                    None => {
                        outcome.rejections.push(self.reject(
                            record,
                            &dim_ref.dimension,
                            format!("missing foreign key field `{}`", dim_ref.key_field),
                        ));
                        continue 'records;
                    }
                };

                let current = with_backoff(self.retry, "fact dimension lookup", || async {
                    store.current_row(&dim_ref.dimension, &foreign_key).await
                })
                .await?;

                match current {
                    Some(row) => {
                        dimension_refs.insert(dim_ref.dimension.clone(), row.surrogate_key);
                    }
                    None => {
                        warn!(
                            "unresolved dimension key `{}` in {} for fact record `{}`",
                            foreign_key, dim_ref.dimension, record.business_key
                        );
                        outcome.rejections.push(self.reject(
                            record,
                            &dim_ref.dimension,
                            format!(
                                "no current {} row for key `{}`",
                                dim_ref.dimension, foreign_key
                            ),
                        ));
                        continue 'records;
                    }
                }
            }

            outcome.rows.push(FactRow {
                fact: self.spec.name.clone(),
                business_key: record.business_key.clone(),
                dimension_refs,
                measures,
                transaction_at: self.transaction_at(record),
            });
        }

        if !outcome.rows.is_empty() {
            let fact = self.spec.name.as_str();
            let rows = &outcome.rows;
            with_backoff(self.retry, "fact upsert", || async {
                store.upsert_facts(fact, rows).await
            })
            .await?;
        }

        info!(
            "fact {} built: {} emitted, {} rejected",
            self.spec.name,
            outcome.rows.len(),
            outcome.rejections.len()
        );
        Ok(outcome)
    }

    fn reject(&self, record: &CleansedRecord, dimension: &str, detail: String) -> RecordRejection {
        RecordRejection {
            reason: RejectReason::UnresolvedDimensionKey,
            source_id: record.source_id.clone(),
            entity: record.entity.clone(),
            business_key: record.business_key.clone(),
            fields: record.fields.clone(),
            failed_rules: vec![dimension.to_string()],
            detail,
            rejected_at: Utc::now(),
        }
    }
}
