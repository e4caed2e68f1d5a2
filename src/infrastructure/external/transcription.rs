use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, info};

use super::{ExternalError, ExternalResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionRequest {
    /// Job handle; the completion event carries it back.
    pub job_name: String,
    pub media_uri: String,
    pub language_code: String,
    /// Where the service writes the transcript JSON.
    pub output_key: String,
}

#[async_trait]
pub trait TranscriptionService: Send + Sync {
    /// Starting a job whose name already exists succeeds without a new job.
    async fn start(&self, request: &TranscriptionRequest) -> ExternalResult<()>;
}

pub struct HttpTranscriptionClient {
    client: Client,
    endpoint: String,
}

impl HttpTranscriptionClient {
    pub fn new(base_url: &str, timeout: Duration) -> ExternalResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/jobs", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl TranscriptionService for HttpTranscriptionClient {
    async fn start(&self, request: &TranscriptionRequest) -> ExternalResult<()> {
        debug!(job = %request.job_name, media = %request.media_uri, "Starting transcription job");

        let response = self.client.post(&self.endpoint).json(request).send().await?;
        let status = response.status();

        if status == StatusCode::CONFLICT {
            info!(job = %request.job_name, "Transcription job already exists");
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExternalError::from_status(status, body));
        }

        info!(job = %request.job_name, "Transcription job started");
        Ok(())
    }
}
