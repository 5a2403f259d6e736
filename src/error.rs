use thiserror::Error;

/// Run-level failure taxonomy.
///
/// Per-record failures (malformed fields, blocking-rule failures, unresolved
/// dimension keys) are not errors to the run: they travel the reject channel
/// as `RecordRejection` values carrying a `RejectReason`, and the quality
/// monitor tallies them. The variants here are the ones that end a run.
#[derive(Error, Debug)]
pub enum RefineryError {
    /// An external read/write still failing once the retry budget is spent
    #[error("transient I/O failure after {attempts} attempt(s): {detail}")]
    TransientIo { attempts: u32, detail: String },

    /// A broken engine contract (duplicate surrogate key, ambiguous
    /// current-row state, invalid measure past validation). Aborts the run
    /// without committing partial output.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("run cancelled before stage `{0}` completed")]
    Cancelled(String),
}

pub type Result<T> = std::result::Result<T, RefineryError>;
