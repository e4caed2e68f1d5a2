use tracing::{error, info};

use super::Outcome;
use super::error::PipelineResult;
use super::events::{JobKind, SubtitleJob, TranscriptionEvent, TranscriptionStatus};
use super::service::PipelineService;
use crate::modules::asset::model::{AssetChange, AssetState, Guard};
use crate::modules::subtitle::primary_language;

impl PipelineService {
    /// Advances `transcribing -> transcribed` and enqueues exactly one job.
    /// The asset's persisted state decides; events with an unknown handle, or
    /// for an asset past `transcribing`, change nothing.
    pub async fn on_transcription_event(&self, event: &TranscriptionEvent) -> PipelineResult<Outcome> {
        let Some(asset) = self.assets.find_by_transcription_job(&event.job_name).await? else {
            return Ok(Outcome::Stale(format!("unknown job handle `{}`", event.job_name)));
        };
        let guard = Guard::state(AssetState::Transcribing).with_job(&event.job_name);

        match event.status {
            TranscriptionStatus::Queued | TranscriptionStatus::InProgress => Ok(Outcome::Ignored(
                format!("job `{}` has not finished", event.job_name),
            )),
            TranscriptionStatus::Failed => {
                let detail = format!(
                    "transcription failed: {}",
                    event.failure_reason.as_deref().unwrap_or("no reason given")
                );
                let change = AssetChange::to(AssetState::Failed).error(Some(detail));
                match self.assets.transition(asset.id, &guard, &change).await? {
                    Some(_) => {
                        info!(asset_id = %asset.id, job = %event.job_name, "Transcription failed, asset marked failed");
                        Ok(Outcome::Done)
                    }
                    None => Ok(Outcome::Stale(format!("asset is `{}`", asset.state))),
                }
            }
            TranscriptionStatus::Completed => {
                let advanced = self
                    .assets
                    .transition(asset.id, &guard, &AssetChange::to(AssetState::Transcribed))
                    .await?;
                let Some(asset) = advanced else {
                    return Ok(Outcome::Stale(format!("asset is `{}`", asset.state)));
                };

                let job = SubtitleJob {
                    kind: JobKind::Generate,
                    asset_id: asset.id,
                    transcription_job: event.job_name.clone(),
                    transcript_key: asset
                        .transcript_key
                        .clone()
                        .unwrap_or_else(|| format!("transcription/{}", event.job_name)),
                    source_language: primary_language(&asset.source_language),
                    target_languages: self.settings.target_languages.clone(),
                };

                if let Err(e) = self.jobs.publish(&job).await {
                    // Hand the asset back so a redelivered completion enqueues again.
                    let back = Guard::state(AssetState::Transcribed).with_job(&event.job_name);
                    if let Err(revert) = self
                        .assets
                        .transition(asset.id, &back, &AssetChange::to(AssetState::Transcribing))
                        .await
                    {
                        error!(asset_id = %asset.id, "Job enqueue failed and state revert failed: {}", revert);
                    }
                    return Err(e.into());
                }

                info!(asset_id = %asset.id, job = %event.job_name, "Subtitle job enqueued");
                Ok(Outcome::Done)
            }
        }
    }
}
