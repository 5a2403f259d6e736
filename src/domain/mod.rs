// Domain data shapes shared across layers

pub mod dimension;
pub mod quality;
pub mod record;

pub use dimension::{DimensionDelta, DimensionRow, FactRow, SurrogateKey};
pub use quality::{AlertCondition, Layer, QualityAlert, QualitySnapshot, RuleOutcome};
pub use record::{
    CleansedRecord, FieldValue, NormalizedRecord, RawRecord, RecordRejection, RejectReason,
    SupersededRecord,
};
