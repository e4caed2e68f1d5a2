use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    response::{IntoResponse, Response},
};
use tracing::error;
use uuid::Uuid;
use validator::Validate;

use super::dto::{AddSubtitleRequest, AddSubtitleResponse, AssetResponse, ListAssetsQuery};
use crate::common::response::{ApiError, ApiResponse, ApiSuccess};
use crate::modules::pipeline::error::PipelineError;
use crate::state::AppState;

/// List assets, newest first
#[utoipa::path(
    get,
    path = "/api/v1/assets",
    params(ListAssetsQuery),
    responses(
        (status = 200, description = "List of assets", body = ApiResponse<Vec<AssetResponse>>),
        (status = 400, description = "Bad Request")
    ),
    tag = "Assets"
)]
pub async fn list_assets(
    State(state): State<AppState>,
    query: Result<Query<ListAssetsQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(e) => return ApiError::bad_request(e.body_text()).into_response(),
    };
    if let Err(e) = query.validate() {
        return ApiError::bad_request(e.to_string()).into_response();
    }

    match state
        .assets
        .list(query.limit.unwrap_or(20), query.offset.unwrap_or(0))
        .await
    {
        Ok(assets) => {
            let items: Vec<AssetResponse> = assets
                .into_iter()
                .map(|asset| AssetResponse::from_asset(asset, &state.links))
                .collect();
            ApiSuccess::ok(items, "Assets retrieved successfully").into_response()
        }
        Err(e) => {
            error!("Failed to list assets: {}", e);
            ApiError::internal(e.to_string()).into_response()
        }
    }
}

/// Get asset by ID
#[utoipa::path(
    get,
    path = "/api/v1/assets/{id}",
    params(
        ("id" = Uuid, Path, description = "Asset ID")
    ),
    responses(
        (status = 200, description = "Asset details", body = ApiResponse<AssetResponse>),
        (status = 404, description = "Asset not found")
    ),
    tag = "Assets"
)]
pub async fn get_asset(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.assets.get(id).await {
        Ok(Some(asset)) => ApiSuccess::ok(
            AssetResponse::from_asset(asset, &state.links),
            "Asset retrieved successfully",
        )
        .into_response(),
        Ok(None) => ApiError::not_found(format!("Asset {id} not found")).into_response(),
        Err(e) => {
            error!(asset_id = %id, "Failed to load asset: {}", e);
            ApiError::internal(e.to_string()).into_response()
        }
    }
}

/// Reset an asset and run the pipeline again under a new revision
#[utoipa::path(
    post,
    path = "/api/v1/assets/{id}/reprocess",
    params(
        ("id" = Uuid, Path, description = "Asset ID")
    ),
    responses(
        (status = 202, description = "Reprocessing started", body = ApiResponse<AssetResponse>),
        (status = 404, description = "Asset not found"),
        (status = 409, description = "Asset changed state concurrently"),
        (status = 503, description = "Dependency unavailable")
    ),
    tag = "Assets"
)]
pub async fn reprocess_asset(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.pipeline.reprocess(id).await {
        Ok(asset) => ApiSuccess::accepted(
            AssetResponse::from_asset(asset, &state.links),
            "Reprocessing started",
        )
        .into_response(),
        Err(PipelineError::NotFound(_)) => {
            ApiError::not_found(format!("Asset {id} not found")).into_response()
        }
        Err(e @ PipelineError::Conflict(_)) => ApiError::conflict(e.to_string()).into_response(),
        Err(e) if e.is_transient() => ApiError::unavailable(e.to_string()).into_response(),
        Err(e) => {
            error!(asset_id = %id, "Reprocess failed: {}", e);
            ApiError::internal(e.to_string()).into_response()
        }
    }
}

/// Subtitle a subtitled asset in one more language
#[utoipa::path(
    post,
    path = "/api/v1/assets/{id}/subtitles",
    params(
        ("id" = Uuid, Path, description = "Asset ID")
    ),
    request_body = AddSubtitleRequest,
    responses(
        (status = 202, description = "Subtitle job enqueued", body = ApiResponse<AddSubtitleResponse>),
        (status = 400, description = "Bad Request"),
        (status = 404, description = "Asset not found"),
        (status = 409, description = "Asset is not subtitled"),
        (status = 503, description = "Dependency unavailable")
    ),
    tag = "Assets"
)]
pub async fn add_subtitle(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<AddSubtitleRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(e) => return ApiError::bad_request(e.body_text()).into_response(),
    };
    if let Err(e) = req.validate() {
        return ApiError::bad_request(e.to_string()).into_response();
    }

    match state.pipeline.add_language(id, &req.target_lang).await {
        Ok(job) => ApiSuccess::accepted(
            AddSubtitleResponse {
                asset_id: job.asset_id,
                target_lang: job.target_languages.first().cloned().unwrap_or_default(),
            },
            "Subtitle job enqueued",
        )
        .into_response(),
        Err(PipelineError::NotFound(_)) => {
            ApiError::not_found(format!("Asset {id} not found")).into_response()
        }
        Err(e @ PipelineError::InvalidInput(_)) => ApiError::bad_request(e.to_string()).into_response(),
        Err(e @ PipelineError::Conflict(_)) => ApiError::conflict(e.to_string()).into_response(),
        Err(e) if e.is_transient() => ApiError::unavailable(e.to_string()).into_response(),
        Err(e) => {
            error!(asset_id = %id, "Failed to enqueue subtitle job: {}", e);
            ApiError::internal(e.to_string()).into_response()
        }
    }
}
