//src/error.rs

use thiserror::Error;

use crate::types::{BackgroundId, SampleId};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("background model {0} does not exist")]
    BackgroundModelNotFound(BackgroundId),

    #[error("sample {0} does not exist")]
    SampleNotFound(SampleId),

    #[error("no usable data for sample {sample_id}: {reason}")]
    SampleDataUnavailable { sample_id: SampleId, reason: String },

    #[error("sample {sample_id} did not finish within {timeout_ms} ms")]
    SampleTimedOut { sample_id: SampleId, timeout_ms: u128 },

    #[error("malformed threshold '{raw}' for {metric}")]
    MalformedThreshold { metric: String, raw: String },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl ReportError {
    /// Errors that only spoil one sample of a batch.
    pub fn is_per_sample(&self) -> bool {
        matches!(
            self,
            ReportError::SampleNotFound(_)
                | ReportError::SampleDataUnavailable { .. }
                | ReportError::SampleTimedOut { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ReportError>;
