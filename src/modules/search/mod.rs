use axum::Router;
use axum::routing::{get, post};

use crate::state::AppState;

pub mod dto;
pub mod handler;
pub mod indexing;
pub mod service;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/search", get(handler::search))
        .route("/index/rebuild", post(handler::rebuild_index))
}
