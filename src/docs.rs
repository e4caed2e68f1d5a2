use utoipa::OpenApi;

use crate::modules::asset::dto::{AddSubtitleRequest, AddSubtitleResponse, AssetResponse, SubtitleLink};
use crate::modules::asset::model::{AssetState, MediaAsset, SubtitleTrack};
use crate::modules::pipeline::events::{
    S3Bucket, S3Entity, S3Object, StorageNotification, StorageRecord, TranscriptionEvent,
    TranscriptionStatus,
};
use crate::modules::pipeline::handler::EventOutcome;
use crate::modules::search::dto::{SearchResponse, SearchResultItem};
use crate::modules::search::indexing::RebuildReport;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::modules::pipeline::handler::storage_event,
        crate::modules::pipeline::handler::transcription_event,
        crate::modules::search::handler::search,
        crate::modules::search::handler::rebuild_index,
        crate::modules::asset::handler::list_assets,
        crate::modules::asset::handler::get_asset,
        crate::modules::asset::handler::reprocess_asset,
        crate::modules::asset::handler::add_subtitle,
    ),
    components(
        schemas(
            StorageNotification, StorageRecord, S3Entity, S3Bucket, S3Object,
            TranscriptionEvent, TranscriptionStatus, EventOutcome,
            SearchResponse, SearchResultItem, RebuildReport,
            AssetResponse, SubtitleLink, AssetState, MediaAsset, SubtitleTrack,
            AddSubtitleRequest, AddSubtitleResponse,
        )
    ),
    tags(
        (name = "Pipeline", description = "Storage and transcription event intake"),
        (name = "Search", description = "Subtitle search across the media library"),
        (name = "Assets", description = "Media asset lifecycle")
    )
)]
pub struct ApiDoc;
