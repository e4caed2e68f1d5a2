pub mod frames;
pub mod transcription;
pub mod translation;

use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum ExternalError {
    #[error("Call timed out")]
    Timeout,
    #[error("Service throttled the request")]
    Throttled,
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
}

pub type ExternalResult<T> = Result<T, ExternalError>;

impl ExternalError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExternalError::Timeout | ExternalError::Throttled | ExternalError::Unavailable(_)
        )
    }

    pub(crate) fn from_status(status: StatusCode, body: String) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            ExternalError::Throttled
        } else if status.is_server_error() {
            ExternalError::Unavailable(format!("{status}: {body}"))
        } else {
            ExternalError::Rejected(format!("{status}: {body}"))
        }
    }
}

impl From<reqwest::Error> for ExternalError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExternalError::Timeout
        } else if e.is_decode() {
            ExternalError::InvalidResponse(e.to_string())
        } else {
            ExternalError::Unavailable(e.to_string())
        }
    }
}
