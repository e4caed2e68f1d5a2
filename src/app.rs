use axum::Router;
use axum::extract::DefaultBodyLimit;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Storage notifications batch records; anything past this is not one.
const MAX_EVENT_BODY: usize = 1024 * 1024;

pub fn create_app(state: AppState) -> Router {
    crate::routes::configure_routes()
        .layer(DefaultBodyLimit::max(MAX_EVENT_BODY))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
