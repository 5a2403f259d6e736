use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use dwh_refinery::app::ports::DimensionStorePort;
use dwh_refinery::app::{CancelFlag, RunPipelineUseCase, RunStatus};
use dwh_refinery::config::warehouse_profile;
use dwh_refinery::domain::{
    DimensionDelta, DimensionRow, FactRow, FieldValue, Layer, RawRecord, RejectReason,
    SurrogateKey,
};
use dwh_refinery::error::RefineryError;
use dwh_refinery::infra::in_memory::{
    InMemoryBatchSource, InMemoryDimensionStore, InMemoryQualitySink, InMemoryRejectSink,
};

fn raw(source: &str, entity: &str, key: &str, fields: &[(&str, &str)]) -> RawRecord {
    RawRecord {
        source_id: source.to_string(),
        entity: entity.to_string(),
        business_key: key.to_string(),
        fields: fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        extracted_at: Utc::now(),
    }
}

struct Fixture {
    source: Arc<InMemoryBatchSource>,
    store: Arc<InMemoryDimensionStore>,
    quality: Arc<InMemoryQualitySink>,
    rejects: Arc<InMemoryRejectSink>,
    use_case: RunPipelineUseCase,
}

fn fixture() -> Fixture {
    let source = Arc::new(InMemoryBatchSource::new());
    let store = Arc::new(InMemoryDimensionStore::new());
    let quality = Arc::new(InMemoryQualitySink::new());
    let rejects = Arc::new(InMemoryRejectSink::new());
    let use_case = RunPipelineUseCase::new(
        warehouse_profile(),
        source.clone(),
        store.clone(),
        quality.clone(),
        rejects.clone(),
    );
    Fixture {
        source,
        store,
        quality,
        rejects,
        use_case,
    }
}

fn seed_baseline(fixture: &Fixture) {
    fixture.source.push_batch(
        "crm",
        vec![
            raw(
                "crm",
                "customer",
                "C001",
                &[
                    ("first_name", "Ada"),
                    ("last_name", "Lovelace"),
                    ("marital_status", "S"),
                    ("create_date", "2023-11-04"),
                ],
            ),
            raw(
                "crm",
                "product",
                "P010",
                &[
                    ("product_name", "Road Bike"),
                    ("cost", "450.00"),
                    ("start_date", "2023-01-01"),
                ],
            ),
            raw(
                "crm",
                "sales",
                "O1001",
                &[
                    ("customer_key", "C001"),
                    ("product_key", "P010"),
                    ("order_date", "2024-05-02"),
                    ("quantity", "3"),
                    ("amount", "1350.00"),
                ],
            ),
        ],
    );
    fixture.source.push_batch(
        "erp",
        vec![raw(
            "erp",
            "customer",
            "C001",
            &[
                ("country", "DE"),
                ("birth_date", "1970-12-10"),
                ("gender", "F"),
            ],
        )],
    );
}

#[tokio::test]
async fn full_run_builds_dimensions_and_facts() -> Result<()> {
    let fixture = fixture();
    seed_baseline(&fixture);

    let report = fixture.use_case.run(&CancelFlag::new()).await?;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.raw_in, 4);
    assert_eq!(report.facts_emitted, 1);
    assert_eq!(report.facts_rejected, 0);

    // One snapshot per layer, published to the monitoring collaborator
    let snapshots = fixture.quality.snapshots.lock().unwrap();
    let layers: Vec<Layer> = snapshots.iter().map(|s| s.layer).collect();
    assert_eq!(layers, vec![Layer::Raw, Layer::Cleansed, Layer::Dimensional]);
    assert!(snapshots
        .iter()
        .all(|s| s.run_id == report.run_id));

    // The emitted fact references surrogate keys, not business keys
    let facts = fixture.store.facts("fact_sales");
    assert_eq!(facts.len(), 1);
    let customer = fixture
        .store
        .current_row("dim_customers", "C001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(facts[0].dimension_refs["dim_customers"], customer.surrogate_key);
    Ok(())
}

#[tokio::test]
async fn higher_priority_source_wins_conflicting_country() -> Result<()> {
    // CRM and ERP disagree on C001's country; ERP outranks CRM in the
    // warehouse profile, so the dimension must carry ERP's value.
    let fixture = fixture();
    fixture.source.push_batch(
        "crm",
        vec![raw(
            "crm",
            "customer",
            "C001",
            &[("first_name", "Ada"), ("country", "US")],
        )],
    );
    fixture.source.push_batch(
        "erp",
        vec![raw("erp", "customer", "C001", &[("country", "DE")])],
    );

    fixture.use_case.run(&CancelFlag::new()).await?;

    let row = fixture
        .store
        .current_row("dim_customers", "C001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.attributes["country"].as_str(), Some("DE"));
    // CRM's non-conflicting attribute still merged in
    assert_eq!(row.attributes["first_name"].as_str(), Some("Ada"));
    Ok(())
}

#[tokio::test]
async fn fact_with_unknown_product_is_rejected_not_dropped() -> Result<()> {
    let fixture = fixture();
    seed_baseline(&fixture);
    fixture.source.push_batch(
        "crm",
        vec![raw(
            "crm",
            "sales",
            "O1002",
            &[
                ("customer_key", "C001"),
                ("product_key", "P999"),
                ("order_date", "2024-05-03"),
                ("quantity", "1"),
                ("amount", "10.00"),
            ],
        )],
    );

    let report = fixture.use_case.run(&CancelFlag::new()).await?;

    assert_eq!(report.facts_emitted, 1);
    assert_eq!(report.facts_rejected, 1);

    let rejections = fixture.rejects.rejections.lock().unwrap();
    let unresolved: Vec<_> = rejections
        .iter()
        .filter(|r| r.reason == RejectReason::UnresolvedDimensionKey)
        .collect();
    assert_eq!(unresolved.len(), 1);
    assert_eq!(unresolved[0].business_key, "O1002");
    assert!(unresolved[0].detail.contains("P999"));
    Ok(())
}

#[tokio::test]
async fn address_change_between_runs_versions_the_dimension() -> Result<()> {
    let fixture = fixture();
    fixture.source.push_batch(
        "crm",
        vec![raw(
            "crm",
            "customer",
            "C001",
            &[("first_name", "Ada"), ("address", "1 Old Street")],
        )],
    );
    fixture.use_case.run(&CancelFlag::new()).await?;
    let old = fixture
        .store
        .current_row("dim_customers", "C001")
        .await
        .unwrap()
        .unwrap();

    // Second run with a changed address
    fixture.source.push_batch(
        "crm",
        vec![raw(
            "crm",
            "customer",
            "C001",
            &[("first_name", "Ada"), ("address", "2 New Avenue")],
        )],
    );
    fixture.use_case.run(&CancelFlag::new()).await?;

    let rows = fixture.store.all_rows("dim_customers").await.unwrap();
    assert_eq!(rows.len(), 2);

    let closed = rows.iter().find(|r| !r.is_current).unwrap();
    assert_eq!(closed.surrogate_key, old.surrogate_key);
    assert!(closed.effective_to.is_some());

    let current = rows.iter().find(|r| r.is_current).unwrap();
    assert_ne!(current.surrogate_key, old.surrogate_key);
    assert_eq!(current.attributes["address"].as_str(), Some("2 New Avenue"));
    Ok(())
}

#[tokio::test]
async fn unchanged_input_across_runs_is_idempotent() -> Result<()> {
    let fixture = fixture();
    seed_baseline(&fixture);
    fixture.use_case.run(&CancelFlag::new()).await?;
    let after_first = fixture.store.all_rows("dim_customers").await.unwrap().len();

    seed_baseline(&fixture);
    let report = fixture.use_case.run(&CancelFlag::new()).await?;

    let after_second = fixture.store.all_rows("dim_customers").await.unwrap().len();
    assert_eq!(after_first, after_second);
    assert!(report
        .dimension_summaries
        .iter()
        .all(|s| s.inserted == 0 && s.closed == 0));
    Ok(())
}

#[tokio::test]
async fn malformed_and_invalid_records_reach_the_reject_channel() -> Result<()> {
    let fixture = fixture();
    seed_baseline(&fixture);
    fixture.source.push_batch(
        "crm",
        vec![
            // Unparseable date: MALFORMED_FIELD at normalization
            raw(
                "crm",
                "customer",
                "C002",
                &[("first_name", "Bad"), ("create_date", "twelfth of never")],
            ),
            // Negative quantity: blocking rule failure at validation
            raw(
                "crm",
                "sales",
                "O1003",
                &[
                    ("customer_key", "C001"),
                    ("product_key", "P010"),
                    ("order_date", "2024-05-04"),
                    ("quantity", "-5"),
                    ("amount", "50.00"),
                ],
            ),
        ],
    );

    let report = fixture.use_case.run(&CancelFlag::new()).await?;
    assert_eq!(report.rejections, 2);

    let rejections = fixture.rejects.rejections.lock().unwrap();
    let malformed = rejections
        .iter()
        .find(|r| r.reason == RejectReason::MalformedField && r.business_key == "C002")
        .unwrap();
    // The offending payload travels with the rejection for replay
    assert_eq!(
        malformed.fields["create_date"],
        FieldValue::Text("twelfth of never".to_string())
    );
    let blocked = rejections
        .iter()
        .find(|r| r.reason == RejectReason::BlockingRuleFailure)
        .unwrap();
    assert!(blocked
        .failed_rules
        .contains(&"quantity_non_negative".to_string()));
    assert_eq!(blocked.fields["quantity"], FieldValue::Integer(-5));
    Ok(())
}

#[tokio::test]
async fn superseded_records_are_retained_in_the_run_report() -> Result<()> {
    let fixture = fixture();
    let ts = Utc::now();
    let mut winner = raw(
        "crm",
        "customer",
        "C001",
        &[("first_name", "Ada"), ("marital_status", "S")],
    );
    let mut loser = raw(
        "crm",
        "customer",
        "C001",
        &[("first_name", "Ada"), ("marital_status", "BAD")],
    );
    winner.extracted_at = ts;
    loser.extracted_at = ts;
    fixture.source.push_batch("crm", vec![winner, loser]);

    let report = fixture.use_case.run(&CancelFlag::new()).await?;

    assert_eq!(report.cleansed_out, 1);
    assert_eq!(report.superseded.len(), 1);
    let audit = &report.superseded[0];
    assert_eq!(audit.tag, "SUPERSEDED");
    assert_eq!(audit.superseded_by_source, "crm");
    // The losing record itself is retained, not just counted
    assert_eq!(
        audit.record.fields["marital_status"],
        FieldValue::Code("BAD".to_string())
    );
    Ok(())
}

/// Delegating store that refuses any publish touching one dimension, standing
/// in for a warehouse that fails mid-stage.
struct RefusingStore {
    inner: InMemoryDimensionStore,
    refuse: String,
}

#[async_trait]
impl DimensionStorePort for RefusingStore {
    async fn current_row(
        &self,
        dimension: &str,
        business_key: &str,
    ) -> std::result::Result<Option<DimensionRow>, String> {
        self.inner.current_row(dimension, business_key).await
    }

    async fn next_surrogate_key(
        &self,
        dimension: &str,
    ) -> std::result::Result<SurrogateKey, String> {
        self.inner.next_surrogate_key(dimension).await
    }

    async fn apply_deltas(&self, deltas: &[DimensionDelta]) -> std::result::Result<(), String> {
        if deltas.iter().any(|d| d.dimension == self.refuse) {
            return Err(format!("{} publish refused", self.refuse));
        }
        self.inner.apply_deltas(deltas).await
    }

    async fn all_rows(&self, dimension: &str) -> std::result::Result<Vec<DimensionRow>, String> {
        self.inner.all_rows(dimension).await
    }

    async fn upsert_facts(
        &self,
        fact: &str,
        rows: &[FactRow],
    ) -> std::result::Result<(), String> {
        self.inner.upsert_facts(fact, rows).await
    }
}

#[tokio::test]
async fn failed_dimension_publish_commits_nothing() -> Result<()> {
    let source = Arc::new(InMemoryBatchSource::new());
    source.push_batch(
        "crm",
        vec![
            raw("crm", "customer", "C001", &[("first_name", "Ada")]),
            raw(
                "crm",
                "product",
                "P010",
                &[("product_name", "Road Bike"), ("cost", "450.00")],
            ),
        ],
    );

    let store = Arc::new(RefusingStore {
        inner: InMemoryDimensionStore::new(),
        refuse: "dim_products".to_string(),
    });
    let quality = Arc::new(InMemoryQualitySink::new());
    let use_case = RunPipelineUseCase::new(
        warehouse_profile(),
        source,
        store.clone(),
        quality.clone(),
        Arc::new(InMemoryRejectSink::new()),
    );

    let err = use_case.run(&CancelFlag::new()).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RefineryError>(),
        Some(RefineryError::TransientIo { .. })
    ));

    // The customer delta was planned alongside the refused product delta and
    // must not be visible after the failed run
    assert!(store.all_rows("dim_customers").await.unwrap().is_empty());
    assert!(store.all_rows("dim_products").await.unwrap().is_empty());
    assert!(quality.snapshots.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn heavy_rejection_rate_raises_alerts() -> Result<()> {
    let fixture = fixture();
    // One good customer and two unparseable ones: 2/3 rejected
    fixture.source.push_batch(
        "crm",
        vec![
            raw("crm", "customer", "C001", &[("first_name", "Ada")]),
            raw("crm", "customer", "C002", &[("create_date", "garbage")]),
            raw("crm", "customer", "C003", &[("create_date", "also garbage")]),
        ],
    );

    let report = fixture.use_case.run(&CancelFlag::new()).await?;
    assert_eq!(report.status, RunStatus::CompletedWithAlerts);

    let alerts = fixture.quality.alerts.lock().unwrap();
    assert!(!alerts.is_empty());
    assert!(alerts.iter().all(|a| a.layer == Layer::Cleansed));
    Ok(())
}

#[tokio::test]
async fn cancelled_run_commits_nothing() -> Result<()> {
    let fixture = fixture();
    seed_baseline(&fixture);

    let cancel = CancelFlag::new();
    cancel.cancel();
    let err = fixture.use_case.run(&cancel).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RefineryError>(),
        Some(RefineryError::Cancelled(_))
    ));

    assert!(fixture.store.all_rows("dim_customers").await.unwrap().is_empty());
    assert!(fixture.store.facts("fact_sales").is_empty());
    assert!(fixture.quality.snapshots.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn cleansed_snapshot_reports_retention_and_rule_tallies() -> Result<()> {
    let fixture = fixture();
    seed_baseline(&fixture);

    fixture.use_case.run(&CancelFlag::new()).await?;

    let snapshots = fixture.quality.snapshots.lock().unwrap();
    let cleansed = snapshots
        .iter()
        .find(|s| s.layer == Layer::Cleansed)
        .unwrap();
    assert_eq!(cleansed.retention_ratio, Some(1.0));
    assert!(!cleansed.rule_outcomes.is_empty());

    let dimensional = snapshots
        .iter()
        .find(|s| s.layer == Layer::Dimensional)
        .unwrap();
    assert_eq!(dimensional.referential_integrity, Some(1.0));
    Ok(())
}

#[tokio::test]
async fn dedup_survivor_is_stable_across_batch_orderings() -> Result<()> {
    // Same multiset of duplicate C001 records delivered in two different
    // orders must produce identical current dimension attributes.
    let run_with_order = |reversed: bool| async move {
        let fixture = fixture();
        let mut records = vec![
            raw(
                "crm",
                "customer",
                "C001",
                &[("first_name", "Ada"), ("marital_status", "S")],
            ),
            raw(
                "crm",
                "customer",
                "C001",
                &[("first_name", "Ada"), ("marital_status", "BAD")],
            ),
        ];
        // Pin timestamps so only the total order decides the survivor
        let ts = Utc::now();
        for r in &mut records {
            r.extracted_at = ts;
        }
        if reversed {
            records.reverse();
        }
        fixture.source.push_batch("crm", records);
        fixture.use_case.run(&CancelFlag::new()).await.unwrap();
        let row = fixture
            .store
            .current_row("dim_customers", "C001")
            .await
            .unwrap()
            .unwrap();
        let attrs: BTreeMap<String, String> = row
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), format!("{:?}", v)))
            .collect();
        attrs
    };

    let forward = run_with_order(false).await;
    let backward = run_with_order(true).await;
    assert_eq!(forward, backward);
    Ok(())
}
