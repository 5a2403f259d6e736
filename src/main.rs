use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::info;

use dwh_refinery::app::{CancelFlag, RunPipelineUseCase};
use dwh_refinery::config::warehouse_profile;
use dwh_refinery::domain::RawRecord;
use dwh_refinery::infra::in_memory::{
    InMemoryBatchSource, InMemoryDimensionStore, InMemoryQualitySink, InMemoryRejectSink,
};
use dwh_refinery::observability;

fn sample(source: &str, entity: &str, key: &str, fields: &[(&str, &str)]) -> RawRecord {
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

/// Demo run over the built-in CRM + ERP profile with in-memory adapters.
/// Production deployments wire warehouse-native adapters into the same ports.
#[tokio::main]
async fn main() -> Result<()> {
    let _guard = observability::logging::init_logging("logs");
    observability::metrics::init();

    let source = Arc::new(InMemoryBatchSource::new());
    source.push_batch(
        "crm",
        vec![
            sample(
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
            sample(
                "crm",
                "product",
                "P010",
                &[
                    ("product_name", "Road Bike"),
                    ("cost", "450.00"),
                    ("start_date", "2023-01-01"),
                ],
            ),
            sample(
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
    source.push_batch(
        "erp",
        vec![sample(
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

    let store = Arc::new(InMemoryDimensionStore::new());
    let use_case = RunPipelineUseCase::new(
        warehouse_profile(),
        source,
        store,
        Arc::new(InMemoryQualitySink::new()),
        Arc::new(InMemoryRejectSink::new()),
    );

    let report = use_case.run(&CancelFlag::new()).await?;
    info!(
        "demo run {} {:?}: {} raw in, {} cleansed, {} rejected, {} facts",
        report.run_id,
        report.status,
        report.raw_in,
        report.cleansed_out,
        report.rejections,
        report.facts_emitted
    );
    for summary in &report.dimension_summaries {
        info!(
            "  {}: {} keys, {} inserted, {} closed, {} unchanged",
            summary.dimension,
            summary.keys_seen,
            summary.inserted,
            summary.closed,
            summary.unchanged
        );
    }
    Ok(())
}
