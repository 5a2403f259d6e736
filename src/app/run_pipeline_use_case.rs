use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};
use uuid::Uuid;

use crate::app::ports::{BatchSourcePort, DimensionStorePort, QualitySinkPort, RejectSinkPort};
use crate::config::RunConfig;
use crate::domain::{
    CleansedRecord, QualityAlert, QualitySnapshot, RecordRejection, SupersededRecord,
};
use crate::error::RefineryError;
use crate::infra::retry::with_backoff;
use crate::observability::metrics::{emit_counter, emit_gauge, emit_histogram, MetricName};
use crate::pipeline::processing::dedupe::Deduplicator;
use crate::pipeline::processing::dimension::{DimensionBuilder, DimensionBuildSummary};
use crate::pipeline::processing::fact::FactBuilder;
use crate::pipeline::processing::normalize::{Normalizer, SchemaNormalizer};
use crate::pipeline::processing::quality::QualityMonitor;
use crate::pipeline::processing::validate::{ValidationEngine, ValidationOutcome, Verdict};

/// Cooperative cancellation checked between stages. A cancelled run commits
/// nothing from the stage that was in flight.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    CompletedWithAlerts,
}

/// What one refinement run did, for operators and callers.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub raw_in: u64,
    pub cleansed_out: u64,
    pub rejections: u64,
    /// Deduplication losers, retained for the audit trail
    pub superseded: Vec<SupersededRecord>,
    pub dimension_summaries: Vec<DimensionBuildSummary>,
    pub facts_emitted: u64,
    pub facts_rejected: u64,
    pub snapshots: Vec<QualitySnapshot>,
    pub alerts: Vec<QualityAlert>,
}

/// Use case for one full refinement run: raw batches through normalization,
/// validation, deduplication, dimension and fact builds, and quality
/// monitoring, in strict dependency order.
pub struct RunPipelineUseCase {
    config: RunConfig,
    source: Arc<dyn BatchSourcePort>,
    store: Arc<dyn DimensionStorePort>,
    quality_sink: Arc<dyn QualitySinkPort>,
    reject_sink: Arc<dyn RejectSinkPort>,
}

impl RunPipelineUseCase {
    pub fn new(
        config: RunConfig,
        source: Arc<dyn BatchSourcePort>,
        store: Arc<dyn DimensionStorePort>,
        quality_sink: Arc<dyn QualitySinkPort>,
        reject_sink: Arc<dyn RejectSinkPort>,
    ) -> Self {
        Self {
            config,
            source,
            store,
            quality_sink,
            reject_sink,
        }
    }

    pub async fn run(&self, cancel: &CancelFlag) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = std::time::Instant::now();
        info!("starting refinement run {}", run_id);

        let result = self.run_inner(run_id, started_at, cancel).await;
        emit_histogram(MetricName::RunDurationSeconds, start.elapsed().as_secs_f64());
        match &result {
            Ok(report) => {
                emit_counter(MetricName::RunsCompleted, 1.0);
                info!(
                    "run {} finished: {} raw in, {} cleansed, {} facts, {} alerts",
                    run_id,
                    report.raw_in,
                    report.cleansed_out,
                    report.facts_emitted,
                    report.alerts.len()
                );
            }
            Err(e) => {
                emit_counter(MetricName::RunsFailed, 1.0);
                error!("run {} failed: {}", run_id, e);
            }
        }
        result
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        cancel: &CancelFlag,
    ) -> Result<RunReport> {
        let retry = self.config.limits.retry.clone();
        let mut monitor = QualityMonitor::new(run_id, self.config.thresholds.clone());

        // Stage 1: pull raw batches per source until each window is drained
        let mut raw_records = Vec::new();
        for source_id in &self.config.source_priority {
            loop {
                let batch = with_backoff(&retry, "source next_batch", || async {
                    self.source.next_batch(source_id).await
                })
                .await?;
                match batch {
                    Some(records) => raw_records.extend(records),
                    None => break,
                }
            }
        }
        let raw_in = raw_records.len() as u64;
        info!("run {}: pulled {} raw records", run_id, raw_in);

        self.checkpoint(cancel, "normalize")?;

        // Stage 2: normalize + validate. Per-record work is independent, so it
        // fans out across workers bounded by the configured concurrency limit;
        // results are re-ordered by input index so downstream deduplication
        // sees a stable order.
        let outcomes = self.cleanse(raw_records).await?;

        let mut cleansed: Vec<CleansedRecord> = Vec::new();
        let mut rejections: Vec<RecordRejection> = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(ValidationOutcome {
                    verdict,
                    rule_results,
                }) => {
                    monitor.observe_rules(&rule_results);
                    match verdict {
                        Verdict::Accepted(record) => {
                            emit_counter(MetricName::ValidateRecordsAccepted, 1.0);
                            emit_histogram(
                                MetricName::ValidateQualityScore,
                                record.quality_score,
                            );
                            cleansed.push(record);
                        }
                        Verdict::Rejected(rejection) => {
                            emit_counter(MetricName::ValidateRecordsRejected, 1.0);
                            rejections.push(rejection);
                        }
                    }
                }
                Err(rejection) => {
                    emit_counter(MetricName::NormalizeRecordsRejected, 1.0);
                    rejections.push(rejection);
                }
            }
        }

        self.checkpoint(cancel, "dedupe")?;

        // Stage 3: collapse duplicate business keys
        let dedupe_outcome = Deduplicator::new(&self.config).dedupe(cleansed);
        let survivors = dedupe_outcome.survivors;
        let superseded: Vec<SupersededRecord> = dedupe_outcome.superseded;
        emit_counter(MetricName::DedupeSurvivors, survivors.len() as f64);
        emit_counter(MetricName::DedupeSuperseded, superseded.len() as f64);

        self.checkpoint(cancel, "dimension build")?;

        // Stage 4a: plan every dimension first, then publish the whole stage
        // as one batch. A failing build or refused publish leaves
        // previously-committed dimension state untouched.
        let run_timestamp = Utc::now();
        let mut dimension_summaries = Vec::new();
        let mut deltas = Vec::new();
        for spec in &self.config.dimensions {
            let builder = DimensionBuilder::new(spec, &retry);
            let plan = builder
                .plan(&survivors, self.store.as_ref(), run_timestamp)
                .await?;
            dimension_summaries.push(plan.summary);
            if !plan.delta.is_empty() {
                deltas.push(plan.delta);
            }
        }
        if !deltas.is_empty() {
            with_backoff(&retry, "dimension stage publish", || async {
                self.store.apply_deltas(&deltas).await
            })
            .await?;
        }
        for summary in &dimension_summaries {
            emit_counter(MetricName::DimensionRowsInserted, summary.inserted as f64);
            emit_counter(MetricName::DimensionRowsClosed, summary.closed as f64);
            emit_counter(MetricName::DimensionRowsUnchanged, summary.unchanged as f64);
        }

        self.checkpoint(cancel, "fact build")?;

        // Stage 4b: fact builds against the now-current dimension state
        let mut facts_emitted = 0u64;
        let mut facts_in = 0u64;
        let mut fact_rejections: Vec<RecordRejection> = Vec::new();
        for spec in &self.config.facts {
            let builder = FactBuilder::new(spec, &retry);
            let outcome = builder.build(&survivors, self.store.as_ref()).await?;
            facts_in += (outcome.rows.len() + outcome.rejections.len()) as u64;
            facts_emitted += outcome.rows.len() as u64;
            emit_counter(MetricName::FactRowsEmitted, outcome.rows.len() as f64);
            emit_counter(MetricName::FactRowsRejected, outcome.rejections.len() as f64);
            fact_rejections.extend(outcome.rejections);
        }
        let referential_integrity = if facts_in > 0 {
            facts_emitted as f64 / facts_in as f64
        } else {
            1.0
        };
        emit_gauge(MetricName::FactReferentialIntegrity, referential_integrity);
        let facts_rejected = fact_rejections.len() as u64;
        rejections.extend(fact_rejections);

        // Every rejection goes to the reject channel, never silently dropped
        for rejection in &rejections {
            with_backoff(&retry, "reject sink write", || async {
                self.reject_sink.record_rejection(rejection).await
            })
            .await?;
        }

        // Stage 5: quality monitoring over everything the run observed
        let cleansed_rejected = rejections.len() as u64 - facts_rejected;
        let snapshots = vec![
            monitor.raw_snapshot(raw_in),
            monitor.cleansed_snapshot(raw_in, survivors.len() as u64, cleansed_rejected),
            monitor.dimensional_snapshot(
                facts_in,
                facts_emitted,
                facts_rejected,
                referential_integrity,
            ),
        ];

        let mut alerts = Vec::new();
        for snapshot in &snapshots {
            emit_gauge(MetricName::QualityLayerScore, snapshot.aggregate_score);
            with_backoff(&retry, "quality snapshot publish", || async {
                self.quality_sink.publish_snapshot(snapshot).await
            })
            .await?;
            for alert in monitor.evaluate(snapshot) {
                emit_counter(MetricName::QualityAlertsRaised, 1.0);
                with_backoff(&retry, "quality alert raise", || async {
                    self.quality_sink.raise_alert(&alert).await
                })
                .await?;
                alerts.push(alert);
            }
        }

        let status = if alerts.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithAlerts
        };

        Ok(RunReport {
            run_id,
            status,
            started_at,
            finished_at: Utc::now(),
            raw_in,
            cleansed_out: survivors.len() as u64,
            rejections: rejections.len() as u64,
            superseded,
            dimension_summaries,
            facts_emitted,
            facts_rejected,
            snapshots,
            alerts,
        })
    }

    /// Normalize and validate raw records with bounded parallelism, returning
    /// outcomes in input order.
    async fn cleanse(
        &self,
        raw_records: Vec<crate::domain::RawRecord>,
    ) -> Result<Vec<std::result::Result<ValidationOutcome, RecordRejection>>> {
        let semaphore = Arc::new(Semaphore::new(self.config.limits.concurrency.max(1)));
        let normalizer = Arc::new(SchemaNormalizer::from_config(&self.config));
        let engine = Arc::new(ValidationEngine::from_config(&self.config));

        let total = raw_records.len();
        let mut join_set = JoinSet::new();
        for (index, raw) in raw_records.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let normalizer = normalizer.clone();
            let engine = engine.clone();
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("cleanse semaphore closed");
                emit_counter(MetricName::NormalizeRecordsProcessed, 1.0);
                let outcome = match normalizer.normalize(&raw) {
                    Ok(normalized) => Ok(engine.validate(&normalized)),
                    Err(rejection) => Err(rejection),
                };
                (index, outcome)
            });
        }

        let mut indexed = Vec::with_capacity(total);
        while let Some(joined) = join_set.join_next().await {
            let (index, outcome) = joined.map_err(|e| {
                RefineryError::InvariantViolation(format!("cleanse worker panicked: {}", e))
            })?;
            indexed.push((index, outcome));
        }
        // Deterministic collection order regardless of completion order
        indexed.sort_by_key(|(index, _)| *index);
        Ok(indexed.into_iter().map(|(_, outcome)| outcome).collect())
    }

    fn checkpoint(&self, cancel: &CancelFlag, stage: &str) -> std::result::Result<(), RefineryError> {
        if cancel.is_cancelled() {
            Err(RefineryError::Cancelled(stage.to_string()))
        } else {
            Ok(())
        }
    }
}
