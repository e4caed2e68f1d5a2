use uuid::Uuid;

use crate::index::IndexError;
use crate::infrastructure::external::ExternalError;
use crate::infrastructure::queue::QueueError;
use crate::infrastructure::storage::StorageError;
use crate::modules::asset::repository::StoreError;
use crate::modules::subtitle::SubtitleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Worth retrying later.
    Transient,
    /// Retrying cannot help.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Asset store: {0}")]
    Store(#[from] StoreError),
    #[error("Object storage: {0}")]
    Storage(#[from] StorageError),
    #[error("Queue: {0}")]
    Queue(#[from] QueueError),
    #[error("External service: {0}")]
    External(#[from] ExternalError),
    #[error("Search index: {0}")]
    Index(#[from] IndexError),
    #[error("Subtitle: {0}")]
    Subtitle(#[from] SubtitleError),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Asset {0} not found")]
    NotFound(Uuid),
    #[error("Asset changed concurrently: {0}")]
    Conflict(String),
    #[error("Required languages failed: {0}")]
    LanguagesFailed(String),
    #[error("Background task failed: {0}")]
    Task(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        let transient = match self {
            PipelineError::Store(e) => matches!(e, StoreError::Database(_)),
            PipelineError::Storage(e) => !matches!(e, StorageError::NotFound(_)),
            PipelineError::Queue(_) => true,
            PipelineError::External(e) => e.is_transient(),
            PipelineError::Index(e) => e.is_transient(),
            PipelineError::Conflict(_) | PipelineError::Task(_) => true,
            PipelineError::Subtitle(_)
            | PipelineError::InvalidInput(_)
            | PipelineError::NotFound(_)
            | PipelineError::LanguagesFailed(_) => false,
        };
        if transient {
            ErrorKind::Transient
        } else {
            ErrorKind::Fatal
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        PipelineError::Task(e.to_string())
    }
}
