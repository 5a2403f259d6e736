//! In-memory adapters for the pipeline's ports.
//!
//! These back the test suite and local demo runs; production deployments
//! plug warehouse-native adapters into the same ports.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::app::ports::{BatchSourcePort, DimensionStorePort, QualitySinkPort, RejectSinkPort};
use crate::domain::{
    DimensionDelta, DimensionRow, FactRow, QualityAlert, QualitySnapshot, RawRecord,
    RecordRejection, SurrogateKey,
};

/// Queue-backed batch source: preloaded batches are handed out per source
/// until the window is drained.
#[derive(Default)]
pub struct InMemoryBatchSource {
    batches: Mutex<HashMap<String, VecDeque<Vec<RawRecord>>>>,
}

impl InMemoryBatchSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(&self, source_id: &str, batch: Vec<RawRecord>) {
        self.batches
            .lock()
            .expect("batch source poisoned")
            .entry(source_id.to_string())
            .or_default()
            .push_back(batch);
    }
}

#[async_trait]
impl BatchSourcePort for InMemoryBatchSource {
    async fn next_batch(&self, source_id: &str) -> Result<Option<Vec<RawRecord>>, String> {
        Ok(self
            .batches
            .lock()
            .map_err(|e| e.to_string())?
            .get_mut(source_id)
            .and_then(|q| q.pop_front()))
    }
}

#[derive(Default)]
struct DimensionState {
    rows: HashMap<String, Vec<DimensionRow>>,
    facts: HashMap<String, Vec<FactRow>>,
    key_counters: HashMap<String, u64>,
}

/// Arena of dimension row versions with a per-key current pointer, the way
/// the historical dimension table really behaves: versions are appended and
/// prior versions are closed, never updated in place.
#[derive(Default)]
pub struct InMemoryDimensionStore {
    state: Mutex<DimensionState>,
}

impl InMemoryDimensionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn facts(&self, fact: &str) -> Vec<FactRow> {
        self.state
            .lock()
            .expect("dimension store poisoned")
            .facts
            .get(fact)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DimensionStorePort for InMemoryDimensionStore {
    async fn current_row(
        &self,
        dimension: &str,
        business_key: &str,
    ) -> Result<Option<DimensionRow>, String> {
        let state = self.state.lock().map_err(|e| e.to_string())?;
        Ok(state.rows.get(dimension).and_then(|rows| {
            rows.iter()
                .find(|r| r.is_current && r.business_key == business_key)
                .cloned()
        }))
    }

    async fn next_surrogate_key(&self, dimension: &str) -> Result<SurrogateKey, String> {
        let mut state = self.state.lock().map_err(|e| e.to_string())?;
        let counter = state.key_counters.entry(dimension.to_string()).or_insert(0);
        *counter += 1;
        Ok(SurrogateKey(*counter))
    }

    async fn apply_deltas(&self, deltas: &[DimensionDelta]) -> Result<(), String> {
        let mut state = self.state.lock().map_err(|e| e.to_string())?;

        // Mutate a working copy under one lock and swap it in only when every
        // delta lands, so a refused batch leaves nothing behind
        let mut staged = state.rows.clone();
        for delta in deltas {
            let rows = staged.entry(delta.dimension.clone()).or_default();
            for closed in &delta.closed {
                match rows
                    .iter_mut()
                    .find(|r| r.surrogate_key == closed.surrogate_key)
                {
                    Some(row) => *row = closed.clone(),
                    None => {
                        return Err(format!(
                            "cannot close unknown surrogate key {}",
                            closed.surrogate_key
                        ))
                    }
                }
            }
            for inserted in &delta.inserted {
                if rows.iter().any(|r| r.surrogate_key == inserted.surrogate_key) {
                    return Err(format!(
                        "surrogate key {} already present",
                        inserted.surrogate_key
                    ));
                }
                rows.push(inserted.clone());
            }
        }
        state.rows = staged;
        Ok(())
    }

    async fn all_rows(&self, dimension: &str) -> Result<Vec<DimensionRow>, String> {
        let state = self.state.lock().map_err(|e| e.to_string())?;
        Ok(state.rows.get(dimension).cloned().unwrap_or_default())
    }

    async fn upsert_facts(&self, fact: &str, rows: &[FactRow]) -> Result<(), String> {
        let mut state = self.state.lock().map_err(|e| e.to_string())?;
        let existing = state.facts.entry(fact.to_string()).or_default();
        for row in rows {
            match existing
                .iter_mut()
                .find(|r| r.business_key == row.business_key)
            {
                Some(slot) => *slot = row.clone(),
                None => existing.push(row.clone()),
            }
        }
        Ok(())
    }
}

/// Captures snapshots and alerts for inspection.
#[derive(Default)]
pub struct InMemoryQualitySink {
    pub snapshots: Mutex<Vec<QualitySnapshot>>,
    pub alerts: Mutex<Vec<QualityAlert>>,
}

impl InMemoryQualitySink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QualitySinkPort for InMemoryQualitySink {
    async fn publish_snapshot(&self, snapshot: &QualitySnapshot) -> Result<(), String> {
        self.snapshots
            .lock()
            .map_err(|e| e.to_string())?
            .push(snapshot.clone());
        Ok(())
    }

    async fn raise_alert(&self, alert: &QualityAlert) -> Result<(), String> {
        self.alerts
            .lock()
            .map_err(|e| e.to_string())?
            .push(alert.clone());
        Ok(())
    }
}

/// Collects rejections for replay or investigation.
#[derive(Default)]
pub struct InMemoryRejectSink {
    pub rejections: Mutex<Vec<RecordRejection>>,
}

impl InMemoryRejectSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RejectSinkPort for InMemoryRejectSink {
    async fn record_rejection(&self, rejection: &RecordRejection) -> Result<(), String> {
        self.rejections
            .lock()
            .map_err(|e| e.to_string())?
            .push(rejection.clone());
        Ok(())
    }
}
