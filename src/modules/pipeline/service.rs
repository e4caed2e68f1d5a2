use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::error::{PipelineError, PipelineResult};
use super::events::{JobKind, ResultEvent, SubtitleJob, SubtitleResult};
use super::Outcome;
use crate::infrastructure::external::frames::FrameExtractor;
use crate::infrastructure::external::transcription::{TranscriptionRequest, TranscriptionService};
use crate::infrastructure::queue::Publisher;
use crate::infrastructure::storage::ObjectStore;
use crate::modules::asset::model::{AssetChange, AssetState, Guard, MediaAsset};
use crate::modules::asset::repository::AssetStore;
use crate::modules::subtitle::primary_language;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub target_languages: Vec<String>,
    pub default_source_language: String,
    pub frame_timeout: Duration,
}

/// Front half of the pipeline: storage notifications, transcription
/// completions and explicit reprocessing.
pub struct PipelineService {
    pub(super) assets: Arc<dyn AssetStore>,
    pub(super) storage: Arc<dyn ObjectStore>,
    pub(super) transcription: Arc<dyn TranscriptionService>,
    pub(super) frames: Arc<dyn FrameExtractor>,
    pub(super) jobs: Publisher<SubtitleJob>,
    pub(super) results: Publisher<ResultEvent>,
    pub(super) settings: PipelineSettings,
}

impl PipelineService {
    pub fn new(
        assets: Arc<dyn AssetStore>,
        storage: Arc<dyn ObjectStore>,
        transcription: Arc<dyn TranscriptionService>,
        frames: Arc<dyn FrameExtractor>,
        jobs: Publisher<SubtitleJob>,
        results: Publisher<ResultEvent>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            assets,
            storage,
            transcription,
            frames,
            jobs,
            results,
            settings,
        }
    }

    /// Frame extraction (best effort), then claim `uploaded -> transcribing`,
    /// then start the external job. The claim precedes the start so a fast
    /// completion event always finds the handle recorded.
    pub(super) async fn start_transcription(&self, asset: MediaAsset) -> PipelineResult<Outcome> {
        let frames = match tokio::time::timeout(
            self.settings.frame_timeout,
            self.frames.extract(asset.id, &asset.source_key),
        )
        .await
        {
            Ok(Ok(frames)) => Some(frames),
            Ok(Err(e)) => {
                warn!(asset_id = %asset.id, "Frame extraction failed, continuing without frames: {}", e);
                None
            }
            Err(_) => {
                warn!(
                    asset_id = %asset.id,
                    timeout_secs = self.settings.frame_timeout.as_secs(),
                    "Frame extraction timed out, continuing without frames"
                );
                None
            }
        };

        let handle = asset.transcription_handle();
        let transcript_key = format!("transcription/{handle}");
        let mut change = AssetChange::to(AssetState::Transcribing).job(&handle, &transcript_key);
        if let Some(frames) = frames {
            change = change.frames(frames.frame_keys, frames.duration_seconds);
        }

        let claimed = self
            .assets
            .transition(asset.id, &Guard::state(AssetState::Uploaded), &change)
            .await?;
        let Some(claimed) = claimed else {
            return Ok(Outcome::Stale("asset left `uploaded` concurrently".to_string()));
        };

        let request = self.transcription_request(&claimed, &handle, transcript_key);
        if let Err(e) = self.transcription.start(&request).await {
            let guard = Guard::state(AssetState::Transcribing).with_job(&handle);
            let rollback = if e.is_transient() {
                // Back to `uploaded` so the redelivered notification retries.
                AssetChange::to(AssetState::Uploaded)
            } else {
                AssetChange::to(AssetState::Failed).error(Some(format!("transcription rejected: {e}")))
            };
            if let Err(store_err) = self.assets.transition(claimed.id, &guard, &rollback).await {
                warn!(asset_id = %claimed.id, "Failed to roll back transcription claim: {}", store_err);
            }
            return Err(e.into());
        }

        info!(asset_id = %claimed.id, job = %handle, "Transcription started");
        Ok(Outcome::Done)
    }

    /// Re-issues the start for an asset already claimed under the current
    /// revision's handle. The service treats a known job name as success, so
    /// this is harmless when the first start did go through.
    pub(super) async fn resume_transcription(&self, asset: MediaAsset) -> PipelineResult<Outcome> {
        let handle = asset.transcription_handle();
        if !asset.holds_job(&handle) {
            return Ok(Outcome::Stale(format!(
                "asset is transcribing under job {:?}",
                asset.transcription_job
            )));
        }
        let transcript_key = asset
            .transcript_key
            .clone()
            .unwrap_or_else(|| format!("transcription/{handle}"));

        let request = self.transcription_request(&asset, &handle, transcript_key);
        if let Err(e) = self.transcription.start(&request).await {
            if !e.is_transient() {
                let guard = Guard::state(AssetState::Transcribing).with_job(&handle);
                let failed = AssetChange::to(AssetState::Failed).error(Some(format!("transcription rejected: {e}")));
                if let Err(store_err) = self.assets.transition(asset.id, &guard, &failed).await {
                    warn!(asset_id = %asset.id, "Failed to record rejected transcription: {}", store_err);
                }
            }
            return Err(e.into());
        }

        info!(asset_id = %asset.id, job = %handle, "Transcription start re-issued");
        Ok(Outcome::Done)
    }

    fn transcription_request(&self, asset: &MediaAsset, handle: &str, output_key: String) -> TranscriptionRequest {
        TranscriptionRequest {
            job_name: handle.to_string(),
            media_uri: self.storage.uri(&asset.source_key),
            language_code: asset.source_language.clone(),
            output_key,
        }
    }

    /// Resets an asset to `uploaded` under a new revision and starts over.
    /// The reset is guarded on the state just read; only once it has won is
    /// the earlier run's result record deleted and withdrawn from the index.
    pub async fn reprocess(&self, id: Uuid) -> PipelineResult<MediaAsset> {
        let asset = self.assets.get(id).await?.ok_or(PipelineError::NotFound(id))?;

        let asset = if asset.state == AssetState::Uploaded {
            asset
        } else {
            self.assets
                .transition(id, &Guard::state(asset.state), &AssetChange::reset())
                .await?
                .ok_or_else(|| PipelineError::Conflict(format!("asset {id} left `{}`", asset.state)))?
        };

        self.storage.delete(&SubtitleResult::record_key(id)).await?;
        self.results
            .publish(&ResultEvent::Withdrawn {
                asset_id: id,
                withdrawn_at: OffsetDateTime::now_utc(),
            })
            .await?;
        info!(asset_id = %id, revision = asset.revision, "Reprocessing asset");

        self.start_transcription(asset).await?;
        self.assets.get(id).await?.ok_or(PipelineError::NotFound(id))
    }

    /// Enqueues a job that subtitles an already subtitled asset in one more
    /// language. The worker merges the new track into the existing ones.
    pub async fn add_language(&self, id: Uuid, target_language: &str) -> PipelineResult<SubtitleJob> {
        let target = primary_language(target_language.trim());
        if target.is_empty() {
            return Err(PipelineError::InvalidInput("target language is empty".to_string()));
        }
        let asset = self.assets.get(id).await?.ok_or(PipelineError::NotFound(id))?;
        if asset.state != AssetState::Subtitled {
            return Err(PipelineError::Conflict(format!(
                "asset {id} is `{}`, not `subtitled`",
                asset.state
            )));
        }
        let Some(handle) = asset.transcription_job.clone() else {
            return Err(PipelineError::Conflict(format!("asset {id} has no transcription")));
        };

        let job = SubtitleJob {
            kind: JobKind::AddLanguages,
            asset_id: id,
            transcript_key: asset
                .transcript_key
                .clone()
                .unwrap_or_else(|| format!("transcription/{handle}")),
            transcription_job: handle,
            source_language: primary_language(&asset.source_language),
            target_languages: vec![target.clone()],
        };
        self.jobs.publish(&job).await?;
        info!(asset_id = %id, language = %target, "Additional subtitle language requested");
        Ok(job)
    }
}
