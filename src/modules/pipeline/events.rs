//! Payloads crossing the pipeline's boundaries.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

use crate::modules::asset::model::SubtitleTrack;

// --- Storage notification ---

#[derive(Debug, Deserialize, ToSchema)]
pub struct StorageNotification {
    #[serde(rename = "Records")]
    pub records: Vec<StorageRecord>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct StorageRecord {
    #[serde(rename = "eventName", default)]
    pub event_name: Option<String>,
    pub s3: S3Entity,
}

impl StorageRecord {
    /// Records without an event name are treated as creations.
    pub fn is_creation(&self) -> bool {
        self.event_name
            .as_deref()
            .is_none_or(|name| name.contains("ObjectCreated"))
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct S3Object {
    /// URL-encoded, `+` for space.
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
}

// --- Transcription completion ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TranscriptionStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct TranscriptionEvent {
    #[validate(length(min = 1, max = 200))]
    pub job_name: String,
    pub status: TranscriptionStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

// --- Job queue ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// First subtitles for a transcribed asset.
    #[default]
    Generate,
    /// Extra languages for an asset that is already subtitled; the new tracks
    /// are merged into the existing ones.
    AddLanguages,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct SubtitleJob {
    #[serde(default)]
    pub kind: JobKind,
    pub asset_id: Uuid,
    #[validate(length(min = 1))]
    pub transcription_job: String,
    #[validate(length(min = 1))]
    pub transcript_key: String,
    #[validate(length(min = 1))]
    pub source_language: String,
    #[validate(length(min = 1))]
    pub target_languages: Vec<String>,
}

// --- Result channel ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct SubtitleResult {
    pub asset_id: Uuid,
    pub title: String,
    #[validate(length(min = 1))]
    pub source_language: String,
    #[validate(length(min = 1))]
    pub tracks: Vec<SubtitleTrack>,
    /// Target languages that produced no track.
    #[serde(default)]
    pub missing_languages: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

impl SubtitleResult {
    pub fn record_key(asset_id: Uuid) -> String {
        format!("results/{asset_id}.json")
    }

    /// Index document version; later generations win.
    pub fn version(&self) -> i64 {
        unix_millis(self.generated_at)
    }
}

pub const RESULTS_PREFIX: &str = "results/";

pub fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResultEvent {
    /// Subtitles for an asset are ready.
    Ready(SubtitleResult),
    /// The asset is being reprocessed; its earlier subtitles are void.
    Withdrawn {
        asset_id: Uuid,
        #[serde(with = "time::serde::rfc3339")]
        withdrawn_at: OffsetDateTime,
    },
}

impl ResultEvent {
    pub fn asset_id(&self) -> Uuid {
        match self {
            ResultEvent::Ready(result) => result.asset_id,
            ResultEvent::Withdrawn { asset_id, .. } => *asset_id,
        }
    }
}

impl Validate for ResultEvent {
    fn validate(&self) -> Result<(), ValidationErrors> {
        match self {
            ResultEvent::Ready(result) => result.validate(),
            ResultEvent::Withdrawn { .. } => Ok(()),
        }
    }
}
