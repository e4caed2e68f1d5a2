use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{ExternalError, ExternalResult};

#[async_trait]
pub trait TranslationService: Send + Sync {
    /// Translates each text, preserving order and count.
    async fn translate(
        &self,
        texts: &[String],
        source_language: &str,
        target_language: &str,
    ) -> ExternalResult<Vec<String>>;
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    texts: &'a [String],
    source_language: &'a str,
    target_language: &'a str,
}

#[derive(Deserialize)]
struct TranslateResponse {
    translations: Vec<String>,
}

pub struct HttpTranslationClient {
    client: Client,
    endpoint: String,
}

impl HttpTranslationClient {
    pub fn new(base_url: &str, timeout: Duration) -> ExternalResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/translate", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl TranslationService for HttpTranslationClient {
    async fn translate(
        &self,
        texts: &[String],
        source_language: &str,
        target_language: &str,
    ) -> ExternalResult<Vec<String>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .json(&TranslateRequest {
                texts,
                source_language,
                target_language,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExternalError::from_status(status, body));
        }

        let body: TranslateResponse = response.json().await?;
        if body.translations.len() != texts.len() {
            return Err(ExternalError::InvalidResponse(format!(
                "expected {} translations, got {}",
                texts.len(),
                body.translations.len()
            )));
        }
        Ok(body.translations)
    }
}
