use thiserror::Error;

use crate::types::JobId;

pub type Result<T> = std::result::Result<T, ScanError>;

/// Job-level failures. Per-host probe failures never surface here; the pool
/// absorbs them into "down" or partially enriched results.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The target specification or port selection is unusable.
    #[error("invalid scan request: {0}")]
    Validation(String),

    /// The probe pool could not schedule any work.
    #[error("probe pool failure: {0}")]
    Pool(String),

    /// The external scanner is missing, exited non-zero, or produced an
    /// unreadable report.
    #[error("external scanner failed: {0}")]
    Adapter(String),

    #[error("inventory store error: {0}")]
    Inventory(String),

    #[error("unknown scan job: {0}")]
    UnknownJob(JobId),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
