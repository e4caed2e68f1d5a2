use axum::Router;
use axum::routing::post;

use crate::state::AppState;

pub mod completion;
pub mod error;
pub mod events;
pub mod handler;
pub mod service;
pub mod trigger;

/// Result of handling one event that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Duplicate or out-of-order event for an asset already past the
    /// relevant state.
    Stale(String),
    /// Event the pipeline does not act on.
    Ignored(String),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Done => "handled",
            Outcome::Stale(_) => "stale",
            Outcome::Ignored(_) => "ignored",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            Outcome::Done => None,
            Outcome::Stale(reason) | Outcome::Ignored(reason) => Some(reason),
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/events/storage", post(handler::storage_event))
        .route("/events/transcription", post(handler::transcription_event))
}
