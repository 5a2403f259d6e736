use std::collections::BTreeMap;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::config::QualityThresholds;
use crate::domain::{AlertCondition, Layer, QualityAlert, QualitySnapshot, RuleOutcome};
use crate::pipeline::processing::validate::RuleResult;

/// Aggregates stage outcomes into layer-level snapshots and decides alerts.
///
/// The monitor only decides whether to raise; delivering notifications is the
/// monitoring collaborator's job. Snapshots are append-only.
pub struct QualityMonitor {
    run_id: Uuid,
    thresholds: QualityThresholds,
    rule_tallies: BTreeMap<String, (u64, u64)>,
}

impl QualityMonitor {
    pub fn new(run_id: Uuid, thresholds: QualityThresholds) -> Self {
        Self {
            run_id,
            thresholds,
            rule_tallies: BTreeMap::new(),
        }
    }

    /// Fold one record's rule results into the per-rule pass/fail tallies.
    pub fn observe_rules(&mut self, results: &[RuleResult]) {
        for result in results {
            let tally = self.rule_tallies.entry(result.name.clone()).or_insert((0, 0));
            if result.passed {
                tally.0 += 1;
            } else {
                tally.1 += 1;
            }
        }
    }

    fn rule_outcomes(&self) -> Vec<RuleOutcome> {
        self.rule_tallies
            .iter()
            .map(|(rule, (passed, failed))| RuleOutcome {
                rule: rule.clone(),
                passed: *passed,
                failed: *failed,
            })
            .collect()
    }

    /// Raw-capture layer: completeness only (did the sources deliver rows).
    pub fn raw_snapshot(&self, records_in: u64) -> QualitySnapshot {
        QualitySnapshot {
            run_id: self.run_id,
            layer: Layer::Raw,
            taken_at: Utc::now(),
            records_in,
            records_out: records_in,
            rejected: 0,
            rule_outcomes: Vec::new(),
            aggregate_score: if records_in > 0 { 1.0 } else { 0.0 },
            retention_ratio: None,
            referential_integrity: None,
        }
    }

    /// Cleansed layer: rule tallies, rejection counts, retention.
    pub fn cleansed_snapshot(
        &self,
        records_in: u64,
        records_out: u64,
        rejected: u64,
    ) -> QualitySnapshot {
        let outcomes = self.rule_outcomes();
        let (passed, evaluated) = outcomes
            .iter()
            .fold((0u64, 0u64), |(p, t), o| (p + o.passed, t + o.passed + o.failed));
        let aggregate_score = if evaluated > 0 {
            passed as f64 / evaluated as f64
        } else {
            1.0
        };
        let retention_ratio = if records_in > 0 {
            Some(records_out as f64 / records_in as f64)
        } else {
            None
        };

        QualitySnapshot {
            run_id: self.run_id,
            layer: Layer::Cleansed,
            taken_at: Utc::now(),
            records_in,
            records_out,
            rejected,
            rule_outcomes: outcomes,
            aggregate_score,
            retention_ratio,
            referential_integrity: None,
        }
    }

    /// Dimensional layer: fact emission counts and referential integrity.
    pub fn dimensional_snapshot(
        &self,
        records_in: u64,
        facts_emitted: u64,
        facts_rejected: u64,
        referential_integrity: f64,
    ) -> QualitySnapshot {
        QualitySnapshot {
            run_id: self.run_id,
            layer: Layer::Dimensional,
            taken_at: Utc::now(),
            records_in,
            records_out: facts_emitted,
            rejected: facts_rejected,
            rule_outcomes: Vec::new(),
            aggregate_score: referential_integrity,
            retention_ratio: None,
            referential_integrity: Some(referential_integrity),
        }
    }

    /// Decide which alert conditions a snapshot breaches.
    pub fn evaluate(&self, snapshot: &QualitySnapshot) -> Vec<QualityAlert> {
        let mut alerts = Vec::new();
        let raised_at = Utc::now();
        let mut raise = |condition, observed: f64, threshold: f64| {
            warn!(
                "quality alert on {} layer: {:?} (observed {:.3}, threshold {:.3})",
                snapshot.layer, condition, observed, threshold
            );
            alerts.push(QualityAlert {
                run_id: self.run_id,
                layer: snapshot.layer,
                condition,
                observed,
                threshold,
                raised_at,
            });
        };

        if snapshot.aggregate_score < self.thresholds.min_layer_score {
            raise(
                AlertCondition::ScoreBelowThreshold,
                snapshot.aggregate_score,
                self.thresholds.min_layer_score,
            );
        }
        if snapshot.rejected > self.thresholds.max_rejections {
            raise(
                AlertCondition::RejectionCountCeiling,
                snapshot.rejected as f64,
                self.thresholds.max_rejections as f64,
            );
        }
        if snapshot.records_in > 0 {
            let ratio = snapshot.rejected as f64 / snapshot.records_in as f64;
            if ratio > self.thresholds.max_rejection_ratio {
                raise(
                    AlertCondition::RejectionRatioCeiling,
                    ratio,
                    self.thresholds.max_rejection_ratio,
                );
            }
        }
        if let Some(retention) = snapshot.retention_ratio {
            if retention < self.thresholds.min_retention_ratio {
                raise(
                    AlertCondition::RetentionBelowFloor,
                    retention,
                    self.thresholds.min_retention_ratio,
                );
            }
        }
        if let Some(integrity) = snapshot.referential_integrity {
            if integrity < self.thresholds.min_referential_integrity {
                raise(
                    AlertCondition::ReferentialIntegrityBelowFloor,
                    integrity,
                    self.thresholds.min_referential_integrity,
                );
            }
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{warehouse_profile, RuleSeverity};

    fn monitor() -> QualityMonitor {
        QualityMonitor::new(Uuid::new_v4(), warehouse_profile().thresholds)
    }

    fn rule(name: &str, passed: bool) -> RuleResult {
        RuleResult {
            name: name.to_string(),
            severity: RuleSeverity::Blocking,
            passed,
        }
    }

    #[test]
    fn tallies_accumulate_per_rule() {
        let mut monitor = monitor();
        monitor.observe_rules(&[rule("a", true), rule("b", false)]);
        monitor.observe_rules(&[rule("a", true), rule("b", true)]);

        let snapshot = monitor.cleansed_snapshot(2, 1, 1);
        let a = snapshot.rule_outcomes.iter().find(|o| o.rule == "a").unwrap();
        let b = snapshot.rule_outcomes.iter().find(|o| o.rule == "b").unwrap();
        assert_eq!((a.passed, a.failed), (2, 0));
        assert_eq!((b.passed, b.failed), (1, 1));
        assert!((snapshot.aggregate_score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn healthy_snapshot_raises_nothing() {
        let mut monitor = monitor();
        monitor.observe_rules(&[rule("a", true), rule("b", true)]);
        let snapshot = monitor.cleansed_snapshot(100, 99, 1);
        assert!(monitor.evaluate(&snapshot).is_empty());
    }

    #[test]
    fn low_score_raises_threshold_alert() {
        let mut monitor = monitor();
        for _ in 0..10 {
            monitor.observe_rules(&[rule("a", false)]);
        }
        let snapshot = monitor.cleansed_snapshot(100, 90, 10);
        let alerts = monitor.evaluate(&snapshot);
        assert!(alerts
            .iter()
            .any(|a| a.condition == AlertCondition::ScoreBelowThreshold));
    }

    #[test]
    fn rejection_ratio_and_retention_alerts_fire_together() {
        let monitor = monitor();
        // 30% rejected, 70% retained: breaches the 20% ceiling and 80% floor
        let snapshot = monitor.cleansed_snapshot(100, 70, 30);
        let alerts = monitor.evaluate(&snapshot);
        assert!(alerts
            .iter()
            .any(|a| a.condition == AlertCondition::RejectionRatioCeiling));
        assert!(alerts
            .iter()
            .any(|a| a.condition == AlertCondition::RetentionBelowFloor));
    }

    #[test]
    fn weak_referential_integrity_raises_alert() {
        let monitor = monitor();
        let snapshot = monitor.dimensional_snapshot(100, 90, 10, 0.9);
        let alerts = monitor.evaluate(&snapshot);
        assert!(alerts
            .iter()
            .any(|a| a.condition == AlertCondition::ReferentialIntegrityBelowFloor));
    }

    #[test]
    fn empty_source_window_scores_raw_layer_zero() {
        let monitor = monitor();
        let snapshot = monitor.raw_snapshot(0);
        assert_eq!(snapshot.aggregate_score, 0.0);
        let alerts = monitor.evaluate(&snapshot);
        assert!(alerts
            .iter()
            .any(|a| a.condition == AlertCondition::ScoreBelowThreshold));
    }
}
