use axum::Router;
use axum::routing::{get, post};

use crate::state::AppState;

pub mod dto;
pub mod handler;
pub mod model;
pub mod repository;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(handler::list_assets))
        .route("/{id}", get(handler::get_asset))
        .route("/{id}/reprocess", post(handler::reprocess_asset))
        .route("/{id}/subtitles", post(handler::add_subtitle))
}
