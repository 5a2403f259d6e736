use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::app::ports::DimensionStorePort;
use crate::config::{DimensionSpec, RetryPolicy};
use crate::domain::{CleansedRecord, DimensionDelta, DimensionRow, FieldValue, SurrogateKey};
use crate::error::{RefineryError, Result};
use crate::infra::retry::with_backoff;

/// Counters from one dimension build.
#[derive(Debug, Clone, Default)]
pub struct DimensionBuildSummary {
    pub dimension: String,
    pub keys_seen: u64,
    pub inserted: u64,
    pub closed: u64,
    pub unchanged: u64,
}

/// One dimension's staged outcome: the delta to publish plus its counters.
/// Nothing is written until the caller publishes the delta, so several
/// dimensions' plans can be applied together as one atomic stage.
#[derive(Debug, Clone)]
pub struct DimensionBuildPlan {
    pub delta: DimensionDelta,
    pub summary: DimensionBuildSummary,
}

/// Produces surrogate-keyed, historically tracked dimension rows (Type-2 SCD).
///
/// The builder merges constituent-source records per business key under the
/// configured constituent precedence and stages every close and insert as a
/// delta for atomic publication. Partial updates are never visible as current
/// to the fact builder. The single-writer build loop serializes updates to
/// each key's current-row state.
pub struct DimensionBuilder<'a> {
    spec: &'a DimensionSpec,
    retry: &'a RetryPolicy,
}

impl<'a> DimensionBuilder<'a> {
    pub fn new(spec: &'a DimensionSpec, retry: &'a RetryPolicy) -> Self {
        Self { spec, retry }
    }

    /// Merge per-source survivors for one business key. Constituents are
    /// visited in configured precedence order; a later-listed source's value
    /// wins on conflicting attributes, but an absent value never erases a
    /// present one.
    fn merge_attributes(
        &self,
        per_source: &BTreeMap<&str, &CleansedRecord>,
    ) -> BTreeMap<String, FieldValue> {
        let mut merged = BTreeMap::new();
        for source in &self.spec.constituents {
            if let Some(record) = per_source.get(source.as_str()) {
                for (name, value) in &record.fields {
                    if value.is_absent() {
                        merged.entry(name.clone()).or_insert(FieldValue::Absent);
                    } else {
                        merged.insert(name.clone(), value.clone());
                    }
                }
            }
        }
        merged
    }

    /// Stage one run's dimension delta without writing anything. Invariants
    /// are checked against the projected post-publish state, so a violation
    /// surfaces before a single row is committed.
    pub async fn plan(
        &self,
        records: &[CleansedRecord],
        store: &dyn DimensionStorePort,
        run_timestamp: DateTime<Utc>,
    ) -> Result<DimensionBuildPlan> {
        let dimension = self.spec.name.as_str();

        // Group constituent-source survivors by business key
        let mut by_key: BTreeMap<&str, BTreeMap<&str, &CleansedRecord>> = BTreeMap::new();
        for record in records {
            if record.entity != self.spec.entity
                || !self.spec.constituents.iter().any(|s| s == &record.source_id)
            {
                continue;
            }
            by_key
                .entry(record.business_key.as_str())
                .or_default()
                .insert(record.source_id.as_str(), record);
        }

        let mut summary = DimensionBuildSummary {
            dimension: dimension.to_string(),
            ..Default::default()
        };
        let mut delta = DimensionDelta::new(dimension);

        for (business_key, per_source) in by_key {
            summary.keys_seen += 1;
            let attributes = self.merge_attributes(&per_source);

            let current = with_backoff(self.retry, "dimension current_row", || async {
                store.current_row(dimension, business_key).await
            })
            .await?;

            match current {
                Some(row) if row.attributes == attributes => {
                    // No attribute change: idempotent no-op
                    summary.unchanged += 1;
                }
                Some(mut row) => {
                    let surrogate_key =
                        with_backoff(self.retry, "surrogate key allocation", || async {
                            store.next_surrogate_key(dimension).await
                        })
                        .await?;
                    debug!(
                        "closing {} row {} for key {}, inserting {}",
                        dimension, row.surrogate_key, business_key, surrogate_key
                    );
                    row.effective_to = Some(run_timestamp);
                    row.is_current = false;
                    delta.closed.push(row);
                    delta.inserted.push(DimensionRow {
                        surrogate_key,
                        dimension: dimension.to_string(),
                        business_key: business_key.to_string(),
                        attributes,
                        effective_from: run_timestamp,
                        effective_to: None,
                        is_current: true,
                    });
                    summary.closed += 1;
                    summary.inserted += 1;
                }
                None => {
                    // New business key; reappearing keys also land here and
                    // get a fresh surrogate key, preserving history integrity
                    let surrogate_key =
                        with_backoff(self.retry, "surrogate key allocation", || async {
                            store.next_surrogate_key(dimension).await
                        })
                        .await?;
                    delta.inserted.push(DimensionRow {
                        surrogate_key,
                        dimension: dimension.to_string(),
                        business_key: business_key.to_string(),
                        attributes,
                        effective_from: run_timestamp,
                        effective_to: None,
                        is_current: true,
                    });
                    summary.inserted += 1;
                }
            }
        }

        let existing = with_backoff(self.retry, "dimension scan", || async {
            store.all_rows(dimension).await
        })
        .await?;
        self.check_invariants(&existing, &delta)?;

        info!(
            "dimension {} planned: {} keys, {} inserted, {} closed, {} unchanged",
            dimension, summary.keys_seen, summary.inserted, summary.closed, summary.unchanged
        );
        Ok(DimensionBuildPlan { delta, summary })
    }

    /// Plan and publish a single dimension. Callers building several
    /// dimensions should collect plans and publish them together instead.
    pub async fn build(
        &self,
        records: &[CleansedRecord],
        store: &dyn DimensionStorePort,
        run_timestamp: DateTime<Utc>,
    ) -> Result<DimensionBuildSummary> {
        let plan = self.plan(records, store, run_timestamp).await?;
        if !plan.delta.is_empty() {
            let deltas = std::slice::from_ref(&plan.delta);
            with_backoff(self.retry, "dimension delta publish", || async {
                store.apply_deltas(deltas).await
            })
            .await?;
        }
        Ok(plan.summary)
    }

    /// Invariant check over the projected post-publish state: surrogate keys
    /// unique, at most one current row per business key. A breach aborts the
    /// run before anything is written.
    fn check_invariants(&self, existing: &[DimensionRow], delta: &DimensionDelta) -> Result<()> {
        let dimension = self.spec.name.as_str();
        let closing: BTreeMap<SurrogateKey, &DimensionRow> = delta
            .closed
            .iter()
            .map(|row| (row.surrogate_key, row))
            .collect();
        let projected = existing
            .iter()
            .map(|row| closing.get(&row.surrogate_key).copied().unwrap_or(row))
            .chain(delta.inserted.iter());

        let mut current_seen: BTreeMap<&str, u32> = BTreeMap::new();
        let mut keys_seen = std::collections::BTreeSet::new();
        for row in projected {
            if !keys_seen.insert(row.surrogate_key) {
                return Err(RefineryError::InvariantViolation(format!(
                    "duplicate surrogate key {} in {}",
                    row.surrogate_key, dimension
                )));
            }
            if row.is_current {
                let n = current_seen.entry(row.business_key.as_str()).or_insert(0);
                *n += 1;
                if *n > 1 {
                    return Err(RefineryError::InvariantViolation(format!(
                        "ambiguous current-row state for {} key `{}`",
                        dimension, row.business_key
                    )));
                }
            }
        }
        Ok(())
    }
}
