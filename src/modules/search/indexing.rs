use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::index::{IndexDocument, IndexError, IndexResult, IndexStatus, IndexWriter, WriteOutcome};
use crate::infrastructure::storage::ObjectStore;
use crate::modules::pipeline::error::{PipelineError, PipelineResult};
use crate::modules::pipeline::events::{RESULTS_PREFIX, ResultEvent, SubtitleResult, unix_millis};
use crate::modules::subtitle::Subtitle;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RebuildReport {
    pub generation: u64,
    pub documents: usize,
    /// Result records that could not be read and were left out.
    pub skipped: usize,
}

/// Keeps the shared index in line with the result records. The index itself
/// is synchronous; every write runs on the blocking pool.
pub struct IndexingService {
    storage: Arc<dyn ObjectStore>,
    writer: Arc<IndexWriter>,
}

impl IndexingService {
    pub fn new(storage: Arc<dyn ObjectStore>, writer: Arc<IndexWriter>) -> Self {
        Self { storage, writer }
    }

    async fn write<F>(&self, op: F) -> PipelineResult<WriteOutcome>
    where
        F: FnOnce(&IndexWriter) -> IndexResult<WriteOutcome> + Send + 'static,
    {
        let writer = self.writer.clone();
        Ok(tokio::task::spawn_blocking(move || op(writer.as_ref())).await??)
    }

    /// One document per asset, one language per track.
    pub async fn document_for(&self, result: &SubtitleResult) -> PipelineResult<IndexDocument> {
        let mut doc = IndexDocument::new(result.asset_id.to_string(), result.version())
            .with_metadata("title", result.title.as_str())
            .with_metadata("source_language", result.source_language.as_str());

        for track in &result.tracks {
            let bytes = self.storage.get(&track.key).await?;
            let text = std::str::from_utf8(&bytes).map_err(|e| {
                PipelineError::InvalidInput(format!("track {} is not UTF-8: {e}", track.key))
            })?;
            let subtitle = Subtitle::parse_vtt(text)?;
            doc = doc.with_language(track.language.as_str(), subtitle.passages());
        }
        Ok(doc)
    }

    pub async fn apply(&self, event: &ResultEvent) -> PipelineResult<WriteOutcome> {
        let outcome = match event {
            ResultEvent::Ready(result) => {
                let doc = self.document_for(result).await?;
                self.write(move |writer| writer.upsert(doc)).await
            }
            ResultEvent::Withdrawn {
                asset_id,
                withdrawn_at,
            } => {
                let id = asset_id.to_string();
                let version = unix_millis(*withdrawn_at);
                self.write(move |writer| writer.delete(&id, version)).await
            }
        };

        match outcome {
            Err(PipelineError::Index(IndexError::Corrupt(reason))) => {
                warn!(asset_id = %event.asset_id(), "Index is corrupt ({}), rebuilding", reason);
                let report = self.rebuild().await?;
                Ok(WriteOutcome::Committed {
                    generation: report.generation,
                })
            }
            other => other,
        }
    }

    async fn load_result(&self, key: &str) -> PipelineResult<SubtitleResult> {
        let bytes = self.storage.get(key).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::InvalidInput(format!("result record {key}: {e}")))
    }

    /// Rebuilds the index from every result record. Unreadable records are
    /// skipped; storage outages abort the rebuild.
    pub async fn rebuild(&self) -> PipelineResult<RebuildReport> {
        let keys = self.storage.list(RESULTS_PREFIX).await?;
        let mut docs = Vec::with_capacity(keys.len());
        let mut skipped = 0;

        for key in keys.iter().filter(|k| k.ends_with(".json")) {
            let doc = match self.load_result(key).await {
                Ok(result) => self.document_for(&result).await,
                Err(e) => Err(e),
            };
            match doc {
                Ok(doc) => docs.push(doc),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    warn!(key = %key, "Skipping unusable result record: {}", e);
                    skipped += 1;
                }
            }
        }

        let documents = docs.len();
        let writer = self.writer.clone();
        let generation = tokio::task::spawn_blocking(move || writer.replace_all(docs)).await??;

        info!(generation, documents, skipped, "Index rebuilt from result records");
        Ok(RebuildReport {
            generation,
            documents,
            skipped,
        })
    }

    /// Startup check: a missing or corrupt index is rebuilt.
    pub async fn ensure_ready(&self) -> PipelineResult<Option<RebuildReport>> {
        let writer = self.writer.clone();
        match tokio::task::spawn_blocking(move || writer.status()).await? {
            Ok(IndexStatus::Ready {
                generation,
                documents,
            }) => {
                info!(generation, documents, "Search index ready");
                Ok(None)
            }
            Ok(IndexStatus::Missing) => {
                info!("Search index missing, building from result records");
                self.rebuild().await.map(Some)
            }
            Err(IndexError::Corrupt(reason)) => {
                warn!("Search index corrupt ({}), rebuilding", reason);
                self.rebuild().await.map(Some)
            }
            Err(e) => Err(e.into()),
        }
    }
}
