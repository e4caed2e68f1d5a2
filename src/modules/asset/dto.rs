use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use super::model::{AssetState, MediaAsset};
use crate::infrastructure::storage::cdn::PlaybackLinks;

#[derive(Debug, Deserialize, Validate, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListAssetsQuery {
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<i64>,
    #[validate(range(min = 0))]
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AddSubtitleRequest {
    /// Language tag; only the primary subtag is used (`fr-CA` makes `fr`).
    #[validate(length(min = 2, max = 35))]
    pub target_lang: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AddSubtitleResponse {
    pub asset_id: Uuid,
    pub target_lang: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SubtitleLink {
    pub language: String,
    pub url: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AssetResponse {
    pub id: Uuid,
    pub title: String,
    pub state: AssetState,
    pub source_language: String,
    pub revision: i32,
    pub duration_seconds: Option<f64>,
    pub video_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub subtitles: Vec<SubtitleLink>,
    pub error_detail: Option<String>,
    #[schema(value_type = String, format = DateTime)]
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: time::OffsetDateTime,
}

impl AssetResponse {
    pub fn from_asset(asset: MediaAsset, links: &PlaybackLinks) -> Self {
        let subtitles = asset
            .subtitle_tracks
            .iter()
            .map(|track| SubtitleLink {
                language: track.language.clone(),
                url: links.object_url(&track.key),
            })
            .collect();

        Self {
            id: asset.id,
            video_url: links.object_url(&asset.source_key),
            thumbnail_url: asset.frame_keys.first().and_then(|key| links.object_url(key)),
            title: asset.title,
            state: asset.state,
            source_language: asset.source_language,
            revision: asset.revision,
            duration_seconds: asset.duration_seconds,
            subtitles,
            error_detail: asset.error_detail,
            updated_at: asset.updated_at,
        }
    }
}
