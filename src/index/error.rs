use std::path::PathBuf;
use std::time::Duration;

use tantivy::directory::error::LockError;
use tantivy::TantivyError;
use thiserror::Error;

pub type IndexResult<T> = Result<T, IndexError>;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Timed out after {0:?} waiting for the index write lease")]
    LockTimeout(Duration),

    #[error("Index write lease was lost before commit")]
    LeaseLost,

    #[error("Concurrent commit detected: expected {expected:?}, found {found:?}")]
    Conflict {
        expected: Option<String>,
        found: Option<String>,
    },

    #[error("Index is corrupt: {0}")]
    Corrupt(String),

    #[error("Index directory not usable: {0}")]
    Unavailable(PathBuf),

    #[error("Text analyzer unavailable: {0}")]
    Analyzer(String),

    #[error("Search engine error: {0}")]
    Tantivy(#[from] TantivyError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IndexError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Errors worth retrying later from the job-queue retry path.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IndexError::LockTimeout(_)
                | IndexError::LeaseLost
                | IndexError::Conflict { .. }
                | IndexError::Io(_)
                | IndexError::Tantivy(TantivyError::LockFailure(LockError::LockBusy, _))
                | IndexError::Tantivy(TantivyError::IoError(_))
        )
    }
}
