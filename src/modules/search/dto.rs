use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::index::SearchQuery;

pub const DEFAULT_LIMIT: usize = 10;

#[derive(Debug, Deserialize, Validate, IntoParams)]
#[into_params(parameter_in = Query)]
#[validate(schema(function = "validate_window"))]
pub struct SearchRequest {
    /// Free-text query.
    #[validate(length(min = 1, max = 256))]
    pub q: String,
    /// Restrict hits to one subtitle language.
    #[validate(length(min = 2, max = 16))]
    pub lang: Option<String>,
    pub asset_id: Option<Uuid>,
    /// Earliest cue start, in seconds.
    #[validate(range(min = 0.0))]
    pub from: Option<f64>,
    /// Latest cue start, in seconds.
    #[validate(range(min = 0.0))]
    pub to: Option<f64>,
    #[validate(range(min = 1, max = 50))]
    pub limit: Option<usize>,
    #[validate(range(max = 1000))]
    pub offset: Option<usize>,
}

fn validate_window(request: &SearchRequest) -> Result<(), ValidationError> {
    match (request.from, request.to) {
        (Some(from), Some(to)) if from > to => Err(ValidationError::new("from_after_to")),
        _ => Ok(()),
    }
}

fn seconds_to_ms(seconds: f64) -> u64 {
    (seconds * 1000.0).round() as u64
}

impl SearchRequest {
    pub fn to_query(&self) -> SearchQuery {
        SearchQuery {
            text: self.q.trim().to_string(),
            language: self.lang.as_ref().map(|lang| lang.to_lowercase()),
            asset_id: self.asset_id.map(|id| id.to_string()),
            from_ms: self.from.map(seconds_to_ms),
            to_ms: self.to.map(seconds_to_ms),
            limit: self.limit.unwrap_or(DEFAULT_LIMIT),
            offset: self.offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SearchResultItem {
    pub asset_id: Uuid,
    pub title: String,
    pub language: String,
    pub score: f32,
    pub snippet: String,
    /// Cue start as `HH:MM:SS.mmm`.
    pub timestamp: String,
    pub start_seconds: f64,
    /// Video URL that starts playback at the matched cue.
    pub playback_url: String,
    pub thumbnail_url: Option<String>,
    pub subtitle_url: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SearchResponse {
    pub query: String,
    pub generation: u64,
    /// Matching assets, less the hits on this page that could not be
    /// hydrated.
    pub total: usize,
    /// Matching assets as counted by the index.
    pub index_total: usize,
    pub results: Vec<SearchResultItem>,
}
