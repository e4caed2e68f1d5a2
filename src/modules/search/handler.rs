use axum::{
    extract::{Query, State, rejection::QueryRejection},
    response::{IntoResponse, Response},
};
use tracing::{error, info};
use validator::Validate;

use super::dto::{SearchRequest, SearchResponse};
use super::indexing::RebuildReport;
use super::service::SearchError;
use crate::common::response::{ApiError, ApiResponse, ApiSuccess};
use crate::state::AppState;

/// Search subtitle text across every indexed asset
#[utoipa::path(
    get,
    path = "/api/v1/search",
    params(SearchRequest),
    responses(
        (status = 200, description = "Ranked matches", body = ApiResponse<SearchResponse>),
        (status = 400, description = "Invalid query"),
        (status = 503, description = "Index unavailable")
    ),
    tag = "Search"
)]
pub async fn search(
    State(state): State<AppState>,
    query: Result<Query<SearchRequest>, QueryRejection>,
) -> Response {
    let Query(request) = match query {
        Ok(query) => query,
        Err(e) => return ApiError::bad_request(e.body_text()).into_response(),
    };
    if let Err(e) = request.validate() {
        return ApiError::bad_request(e.to_string()).into_response();
    }

    match state.search.search(&request).await {
        Ok(response) => ApiSuccess::ok(response, "Search completed").into_response(),
        Err(SearchError::Index(e)) if e.is_transient() => {
            ApiError::unavailable(e.to_string()).into_response()
        }
        Err(e) => {
            error!("Search failed: {}", e);
            ApiError::internal(e.to_string()).into_response()
        }
    }
}

/// Rebuild the index from stored result records
#[utoipa::path(
    post,
    path = "/api/v1/index/rebuild",
    responses(
        (status = 200, description = "Index rebuilt", body = ApiResponse<RebuildReport>),
        (status = 503, description = "Storage or index unavailable")
    ),
    tag = "Search"
)]
pub async fn rebuild_index(State(state): State<AppState>) -> Response {
    match state.indexing.rebuild().await {
        Ok(report) => {
            info!(generation = report.generation, "Index rebuild requested via API");
            ApiSuccess::ok(report, "Index rebuilt").into_response()
        }
        Err(e) if e.is_transient() => ApiError::unavailable(e.to_string()).into_response(),
        Err(e) => {
            error!("Index rebuild failed: {}", e);
            ApiError::internal(e.to_string()).into_response()
        }
    }
}
