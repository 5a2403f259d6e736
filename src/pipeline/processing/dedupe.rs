use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::Utc;

use crate::config::{DedupeScope, RunConfig};
use crate::domain::{CleansedRecord, SupersededRecord};

/// Outcome of collapsing duplicate business keys for one run.
#[derive(Debug, Clone)]
pub struct DedupeOutcome {
    /// Exactly one record per group, in deterministic group order
    pub survivors: Vec<CleansedRecord>,
    /// Losing records, tagged SUPERSEDED for the audit trail
    pub superseded: Vec<SupersededRecord>,
}

/// Collapses repeated business keys using a recency/priority policy.
///
/// Survivor selection is a total order: highest quality score, then most
/// recent extraction timestamp, then configured source priority, then the
/// canonical serialization of the field map. The final tiebreak makes the
/// comparison total, so the same input multiset yields the same survivor
/// regardless of arrival order.
pub struct Deduplicator<'a> {
    config: &'a RunConfig,
}

impl<'a> Deduplicator<'a> {
    pub fn new(config: &'a RunConfig) -> Self {
        Self { config }
    }

    fn group_key(&self, record: &CleansedRecord) -> (String, String, String) {
        match self.config.dedupe_scope {
            DedupeScope::PerSource => (
                record.entity.clone(),
                record.source_id.clone(),
                record.business_key.clone(),
            ),
            DedupeScope::CrossSource => (
                record.entity.clone(),
                String::new(),
                record.business_key.clone(),
            ),
        }
    }

    /// `a` beats `b` when it sorts earlier under the survivor order.
    fn survivor_order(&self, a: &CleansedRecord, b: &CleansedRecord) -> Ordering {
        b.quality_score
            .total_cmp(&a.quality_score)
            .then_with(|| b.extracted_at.cmp(&a.extracted_at))
            .then_with(|| {
                self.config
                    .source_rank(&a.source_id)
                    .cmp(&self.config.source_rank(&b.source_id))
            })
            .then_with(|| a.canonical_fields().cmp(&b.canonical_fields()))
    }

    pub fn dedupe(&self, records: Vec<CleansedRecord>) -> DedupeOutcome {
        let mut groups: BTreeMap<(String, String, String), Vec<CleansedRecord>> = BTreeMap::new();
        for record in records {
            groups.entry(self.group_key(&record)).or_default().push(record);
        }

        let decided_at = Utc::now();
        let mut survivors = Vec::with_capacity(groups.len());
        let mut superseded = Vec::new();

        for (_, mut group) in groups {
            group.sort_by(|a, b| self.survivor_order(a, b));
            let mut iter = group.into_iter();
            let winner = iter.next().expect("groups are never empty");
            let winner_source = winner.source_id.clone();
            for loser in iter {
                superseded.push(SupersededRecord::new(loser, &winner_source, decided_at));
            }
            survivors.push(winner);
        }

        DedupeOutcome {
            survivors,
            superseded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::warehouse_profile;
    use crate::domain::FieldValue;
    use chrono::{Duration, Utc};

    fn cleansed(source: &str, key: &str, score: f64, age_secs: i64, name: &str) -> CleansedRecord {
        CleansedRecord {
            source_id: source.to_string(),
            entity: "customer".to_string(),
            business_key: key.to_string(),
            fields: [(
                "first_name".to_string(),
                FieldValue::Text(name.to_string()),
            )]
            .into(),
            validity: true,
            quality_score: score,
            extracted_at: Utc::now() - Duration::seconds(age_secs),
            cleansed_at: Utc::now(),
        }
    }

    fn cross_source_config() -> crate::config::RunConfig {
        let mut config = warehouse_profile();
        config.dedupe_scope = DedupeScope::CrossSource;
        config
    }

    #[test]
    fn highest_quality_score_survives() {
        let config = cross_source_config();
        let outcome = Deduplicator::new(&config).dedupe(vec![
            cleansed("crm", "C001", 0.7, 0, "low"),
            cleansed("crm", "C001", 0.9, 100, "high"),
        ]);

        assert_eq!(outcome.survivors.len(), 1);
        assert_eq!(
            outcome.survivors[0].fields["first_name"],
            FieldValue::Text("high".to_string())
        );
        assert_eq!(outcome.superseded.len(), 1);
        assert_eq!(outcome.superseded[0].tag, "SUPERSEDED");
    }

    #[test]
    fn recency_breaks_score_ties() {
        let config = cross_source_config();
        let outcome = Deduplicator::new(&config).dedupe(vec![
            cleansed("crm", "C001", 0.9, 500, "stale"),
            cleansed("crm", "C001", 0.9, 0, "fresh"),
        ]);

        assert_eq!(
            outcome.survivors[0].fields["first_name"],
            FieldValue::Text("fresh".to_string())
        );
    }

    #[test]
    fn source_priority_breaks_remaining_ties() {
        let config = cross_source_config();
        let ts = Utc::now();
        let mut a = cleansed("crm", "C001", 0.9, 0, "from-crm");
        let mut b = cleansed("erp", "C001", 0.9, 0, "from-erp");
        a.extracted_at = ts;
        b.extracted_at = ts;

        // erp outranks crm in the warehouse profile
        let outcome = Deduplicator::new(&config).dedupe(vec![a, b]);
        assert_eq!(outcome.survivors[0].source_id, "erp");
        assert_eq!(outcome.superseded[0].superseded_by_source, "erp");
    }

    #[test]
    fn survivor_selection_is_arrival_order_independent() {
        let config = cross_source_config();
        let ts = Utc::now();
        let mut records: Vec<CleansedRecord> = (0..6)
            .map(|i| {
                let mut r = cleansed("crm", "C001", 0.9, 0, &format!("variant-{}", i));
                r.extracted_at = ts;
                r
            })
            .collect();

        let dedup = Deduplicator::new(&config);
        let first = dedup.dedupe(records.clone()).survivors;

        // Rotate and reverse to simulate different arrival orders
        records.rotate_left(3);
        records.reverse();
        let second = dedup.dedupe(records).survivors;

        assert_eq!(first.len(), 1);
        assert_eq!(
            first[0].canonical_fields(),
            second[0].canonical_fields()
        );
    }

    #[test]
    fn per_source_scope_keeps_one_survivor_per_source() {
        let config = warehouse_profile(); // PerSource
        let outcome = Deduplicator::new(&config).dedupe(vec![
            cleansed("crm", "C001", 0.9, 0, "crm-new"),
            cleansed("crm", "C001", 0.8, 100, "crm-old"),
            cleansed("erp", "C001", 0.9, 0, "erp-only"),
        ]);

        assert_eq!(outcome.survivors.len(), 2);
        assert_eq!(outcome.superseded.len(), 1);
    }
}
