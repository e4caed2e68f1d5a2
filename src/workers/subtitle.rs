use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{MessageHandler, RetryPolicy};
use crate::common::retry::{RetryConfig, retry_async};
use crate::infrastructure::external::ExternalError;
use crate::infrastructure::external::translation::TranslationService;
use crate::infrastructure::queue::Publisher;
use crate::infrastructure::storage::{ObjectStore, StorageError};
use crate::modules::asset::model::{AssetChange, AssetState, Guard, MediaAsset, SubtitleTrack};
use crate::modules::asset::repository::AssetStore;
use crate::modules::pipeline::Outcome;
use crate::modules::pipeline::error::{PipelineError, PipelineResult};
use crate::modules::pipeline::events::{JobKind, ResultEvent, SubtitleJob, SubtitleResult};
use crate::modules::subtitle::{Subtitle, primary_language, track_key};

const VTT_CONTENT_TYPE: &str = "text/vtt";
const SRT_CONTENT_TYPE: &str = "application/x-subrip";

#[derive(Debug, Clone)]
pub struct SubtitleWorkerSettings {
    /// Languages that must produce a track, or the asset fails.
    pub required_languages: Vec<String>,
    pub translate_retry: RetryConfig,
    /// Must match the consumer's policy so the asset state and the queue
    /// agree on whether another attempt follows.
    pub policy: RetryPolicy,
}

pub struct SubtitleWorker {
    assets: Arc<dyn AssetStore>,
    storage: Arc<dyn ObjectStore>,
    translation: Arc<dyn TranslationService>,
    results: Publisher<ResultEvent>,
    settings: SubtitleWorkerSettings,
}

/// Languages in request order, normalized to primary subtags, without repeats.
fn normalize_languages(languages: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    for lang in languages.iter().map(|l| primary_language(l.trim())) {
        if !lang.is_empty() && !seen.contains(&lang) {
            seen.push(lang);
        }
    }
    seen
}

/// Existing tracks in their order with same-language tracks replaced, then
/// the tracks for languages the asset did not have yet.
fn merge_tracks(existing: &[SubtitleTrack], added: Vec<SubtitleTrack>) -> Vec<SubtitleTrack> {
    let mut merged: Vec<SubtitleTrack> = Vec::with_capacity(existing.len() + added.len());
    for track in existing.iter().cloned().chain(added) {
        match merged.iter_mut().find(|t| t.language == track.language) {
            Some(slot) => *slot = track,
            None => merged.push(track),
        }
    }
    merged
}

impl SubtitleWorker {
    pub fn new(
        assets: Arc<dyn AssetStore>,
        storage: Arc<dyn ObjectStore>,
        translation: Arc<dyn TranslationService>,
        results: Publisher<ResultEvent>,
        settings: SubtitleWorkerSettings,
    ) -> Self {
        Self {
            assets,
            storage,
            translation,
            results,
            settings,
        }
    }

    async fn track_for(&self, source: &Subtitle, source_language: &str, target: &str) -> PipelineResult<Subtitle> {
        if target == source_language || source.is_empty() {
            return Ok(source.clone());
        }

        let texts = source.texts();
        let texts = texts.as_slice();
        let translation = self.translation.as_ref();
        let operation = format!("translate {source_language}->{target}");
        let translated = retry_async(
            &self.settings.translate_retry,
            &operation,
            |e: &ExternalError| e.is_transient(),
            move || translation.translate(texts, source_language, target),
        )
        .await?;

        source.with_texts(translated).ok_or_else(|| {
            PipelineError::InvalidInput(format!("translation to {target} changed the cue count"))
        })
    }

    /// Translates and stores one track per language. Languages whose
    /// translation fails are returned as missing; storage failures abort.
    async fn render_tracks(
        &self,
        asset_id: Uuid,
        source: &Subtitle,
        source_language: &str,
        languages: &[String],
    ) -> PipelineResult<(Vec<SubtitleTrack>, Vec<String>)> {
        let mut tracks = Vec::new();
        let mut missing = Vec::new();
        for lang in normalize_languages(languages) {
            match self.track_for(source, source_language, &lang).await {
                Ok(subtitle) => {
                    let key = track_key(asset_id, &lang);
                    self.storage
                        .put(&key, Bytes::from(subtitle.to_vtt()), VTT_CONTENT_TYPE)
                        .await?;
                    self.storage
                        .put(
                            &key.replace(".vtt", ".srt"),
                            Bytes::from(subtitle.to_srt()),
                            SRT_CONTENT_TYPE,
                        )
                        .await?;
                    tracks.push(SubtitleTrack { language: lang, key });
                }
                Err(e) => {
                    warn!(asset_id = %asset_id, language = %lang, "Language produced no track: {}", e);
                    missing.push(lang);
                }
            }
        }
        Ok((tracks, missing))
    }

    /// Produces, persists and records every track, ending in `subtitled`.
    /// `None` means the asset left `subtitling` underneath us.
    async fn generate(&self, asset: &MediaAsset, job: &SubtitleJob) -> PipelineResult<Option<SubtitleResult>> {
        let transcript = self.storage.get(&job.transcript_key).await?;
        let source = Subtitle::from_transcript(&transcript)?;
        let source_language = primary_language(&job.source_language);

        let (tracks, missing) = self
            .render_tracks(asset.id, &source, &source_language, &job.target_languages)
            .await?;

        let required = normalize_languages(&self.settings.required_languages);
        let failed_required: Vec<&String> = required.iter().filter(|lang| missing.contains(lang)).collect();
        if !failed_required.is_empty() {
            let langs: Vec<&str> = failed_required.iter().map(|l| l.as_str()).collect();
            return Err(PipelineError::LanguagesFailed(langs.join(", ")));
        }
        if tracks.is_empty() {
            return Err(PipelineError::LanguagesFailed(format!(
                "no track produced for {}",
                missing.join(", ")
            )));
        }

        let result = SubtitleResult {
            asset_id: asset.id,
            title: asset.title.clone(),
            source_language,
            tracks: tracks.clone(),
            missing_languages: missing.clone(),
            generated_at: OffsetDateTime::now_utc(),
        };
        self.write_record(&result).await?;

        let detail = if missing.is_empty() {
            None
        } else {
            Some(format!("no subtitles for: {}", missing.join(", ")))
        };
        let change = AssetChange::to(AssetState::Subtitled).tracks(tracks).error(detail);
        let guard = Guard::state(AssetState::Subtitling).with_job(&job.transcription_job);

        match self.assets.transition(asset.id, &guard, &change).await? {
            Some(_) => Ok(Some(result)),
            None => {
                if let Err(e) = self.storage.delete(&SubtitleResult::record_key(asset.id)).await {
                    warn!(asset_id = %asset.id, "Failed to drop orphaned result record: {}", e);
                }
                Ok(None)
            }
        }
    }

    async fn write_record(&self, result: &SubtitleResult) -> PipelineResult<()> {
        let body = serde_json::to_vec(result)
            .map_err(|e| PipelineError::InvalidInput(format!("result record encoding: {e}")))?;
        self.storage
            .put(
                &SubtitleResult::record_key(result.asset_id),
                Bytes::from(body),
                "application/json",
            )
            .await?;
        Ok(())
    }

    /// Adds the job's languages to a subtitled asset. The asset stays
    /// `subtitled` throughout; the merged result replaces the earlier one.
    async fn add_languages(&self, asset: &MediaAsset, job: &SubtitleJob) -> PipelineResult<Outcome> {
        let guard = Guard::state(AssetState::Subtitled).with_job(&job.transcription_job);
        if !guard.admits(asset) {
            return Ok(Outcome::Stale(format!(
                "asset is `{}` with job {:?}",
                asset.state, asset.transcription_job
            )));
        }

        let transcript = self.storage.get(&job.transcript_key).await?;
        let source = Subtitle::from_transcript(&transcript)?;
        let source_language = primary_language(&job.source_language);
        let (added, missing) = self
            .render_tracks(asset.id, &source, &source_language, &job.target_languages)
            .await?;
        if added.is_empty() {
            return Err(PipelineError::LanguagesFailed(missing.join(", ")));
        }

        let tracks = merge_tracks(&asset.subtitle_tracks, added);
        let Some(updated) = self
            .assets
            .transition(asset.id, &guard, &AssetChange::to(AssetState::Subtitled).tracks(tracks))
            .await?
        else {
            return Ok(Outcome::Stale("asset changed while adding languages".to_string()));
        };

        let mut still_missing = self
            .existing_result(&updated)
            .await?
            .map(|r| r.missing_languages)
            .unwrap_or_default();
        still_missing.extend(missing);
        still_missing.retain(|lang| !updated.subtitle_tracks.iter().any(|t| &t.language == lang));
        still_missing.sort();
        still_missing.dedup();

        let result = SubtitleResult {
            asset_id: updated.id,
            title: updated.title.clone(),
            source_language,
            tracks: updated.subtitle_tracks.clone(),
            missing_languages: still_missing,
            generated_at: OffsetDateTime::now_utc(),
        };
        self.write_record(&result).await?;
        self.results.publish(&ResultEvent::Ready(result)).await?;

        let languages: Vec<&str> = updated.subtitle_tracks.iter().map(|t| t.language.as_str()).collect();
        info!(asset_id = %updated.id, languages = ?languages, "Subtitle languages added");
        Ok(Outcome::Done)
    }

    async fn existing_result(&self, asset: &MediaAsset) -> PipelineResult<Option<SubtitleResult>> {
        match self.storage.get(&SubtitleResult::record_key(asset.id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PipelineError::InvalidInput(format!("result record: {e}"))),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Hands a claimed asset back for another attempt, or fails it.
    async fn release(&self, asset: &MediaAsset, job: &SubtitleJob, cause: &PipelineError, attempt: u32) {
        let change = if cause.is_transient() && self.settings.policy.allows_retry(attempt) {
            AssetChange::to(AssetState::Transcribed)
        } else {
            AssetChange::to(AssetState::Failed).error(Some(cause.to_string()))
        };
        let guard = Guard::state(AssetState::Subtitling).with_job(&job.transcription_job);

        match self.assets.transition(asset.id, &guard, &change).await {
            Ok(Some(updated)) => {
                info!(asset_id = %asset.id, state = %updated.state, "Released subtitle claim")
            }
            Ok(None) => warn!(asset_id = %asset.id, "Asset left `subtitling` before release"),
            Err(e) => error!(asset_id = %asset.id, "Failed to release subtitle claim: {}", e),
        }
    }

    /// An earlier attempt reached `subtitled` but may not have published.
    async fn republish(&self, asset: &MediaAsset) -> PipelineResult<Outcome> {
        let result = match self.existing_result(asset).await? {
            Some(result) => result,
            None => {
                let result = SubtitleResult {
                    asset_id: asset.id,
                    title: asset.title.clone(),
                    source_language: primary_language(&asset.source_language),
                    tracks: asset.subtitle_tracks.clone(),
                    missing_languages: Vec::new(),
                    generated_at: asset.updated_at,
                };
                self.write_record(&result).await?;
                result
            }
        };

        self.results.publish(&ResultEvent::Ready(result)).await?;
        info!(asset_id = %asset.id, "Republished subtitle result");
        Ok(Outcome::Done)
    }
}

#[async_trait]
impl MessageHandler for SubtitleWorker {
    type Message = SubtitleJob;

    fn name(&self) -> &'static str {
        "subtitle"
    }

    async fn handle(&self, job: &SubtitleJob, attempt: u32) -> Result<Outcome, PipelineError> {
        let Some(asset) = self.assets.get(job.asset_id).await? else {
            return Ok(Outcome::Stale(format!("unknown asset {}", job.asset_id)));
        };

        if job.kind == JobKind::AddLanguages {
            return self.add_languages(&asset, job).await;
        }
        if asset.state == AssetState::Subtitled && asset.holds_job(&job.transcription_job) {
            return self.republish(&asset).await;
        }

        let guard = Guard::state(AssetState::Transcribed).with_job(&job.transcription_job);
        if !guard.admits(&asset) {
            return Ok(Outcome::Stale(format!(
                "asset is `{}` with job {:?}",
                asset.state, asset.transcription_job
            )));
        }
        let Some(claimed) = self
            .assets
            .transition(asset.id, &guard, &AssetChange::to(AssetState::Subtitling))
            .await?
        else {
            return Ok(Outcome::Stale("asset claimed concurrently".to_string()));
        };
        info!(asset_id = %claimed.id, attempt, "Generating subtitles");

        let result = match self.generate(&claimed, job).await {
            Ok(Some(result)) => result,
            Ok(None) => return Ok(Outcome::Stale("asset left `subtitling` during generation".to_string())),
            Err(e) => {
                self.release(&claimed, job, &e, attempt).await;
                return Err(e);
            }
        };

        let languages: Vec<&str> = result.tracks.iter().map(|t| t.language.as_str()).collect();
        // A failed publish leaves the asset `subtitled`; redelivery republishes.
        self.results.publish(&ResultEvent::Ready(result.clone())).await?;
        info!(
            asset_id = %claimed.id,
            languages = ?languages,
            missing = ?result.missing_languages,
            "Subtitles published"
        );
        Ok(Outcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn languages_are_normalized_and_deduplicated() {
        let langs = vec!["en-GB".to_string(), "FR".into(), "en".into(), " ".into(), "fr_CA".into()];
        assert_eq!(normalize_languages(&langs), vec!["en".to_string(), "fr".to_string()]);
    }

    #[test]
    fn merged_tracks_keep_one_per_language() {
        let track = |lang: &str, key: &str| SubtitleTrack {
            language: lang.to_string(),
            key: key.to_string(),
        };
        let merged = merge_tracks(
            &[track("en", "a/en.vtt"), track("fr", "a/fr.vtt")],
            vec![track("de", "b/de.vtt"), track("fr", "b/fr.vtt")],
        );
        assert_eq!(
            merged,
            vec![track("en", "a/en.vtt"), track("fr", "b/fr.vtt"), track("de", "b/de.vtt")]
        );
    }
}
