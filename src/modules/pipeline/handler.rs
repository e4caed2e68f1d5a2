use axum::{
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{error, info, warn};
use utoipa::ToSchema;
use validator::Validate;

use super::Outcome;
use super::error::PipelineError;
use super::events::{StorageNotification, TranscriptionEvent};
use crate::common::response::{ApiError, ApiResponse, ApiSuccess};
use crate::infrastructure::queue::{DeadLetter, PIPELINE_EVENTS_DLQ, dead_letter};
use crate::state::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct EventOutcome {
    pub subject: String,
    pub outcome: String,
    pub detail: Option<String>,
}

impl EventOutcome {
    fn from_outcome(subject: &str, outcome: &Outcome) -> Self {
        Self {
            subject: subject.to_string(),
            outcome: outcome.label().to_string(),
            detail: outcome.detail().map(str::to_string),
        }
    }

    fn failed(subject: &str, e: &PipelineError) -> Self {
        Self {
            subject: subject.to_string(),
            outcome: "failed".to_string(),
            detail: Some(e.to_string()),
        }
    }
}

async fn park(state: &AppState, reason: &str, body: &[u8]) {
    let record = DeadLetter::new(reason, 0, body);
    if let Err(e) = dead_letter(state.bus.as_ref(), PIPELINE_EVENTS_DLQ, &record).await {
        error!("Failed to dead-letter pipeline event: {}", e);
    }
}

async fn reject(state: &AppState, reason: String, body: &[u8]) -> Response {
    warn!("Rejecting pipeline event: {}", reason);
    park(state, &reason, body).await;
    ApiError::bad_request(reason).into_response()
}

fn log_outcome(subject: &str, outcome: &Outcome) {
    match outcome {
        Outcome::Done => info!(subject, "Pipeline event handled"),
        Outcome::Stale(reason) => info!(subject, reason = %reason, "Discarding stale pipeline event"),
        Outcome::Ignored(reason) => info!(subject, reason = %reason, "Ignoring pipeline event"),
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/events/storage",
    request_body = StorageNotification,
    responses(
        (status = 200, description = "Handled, stale or ignored", body = ApiResponse<Vec<EventOutcome>>),
        (status = 400, description = "Malformed notification, dead-lettered"),
        (status = 503, description = "Transient failure, retry later")
    ),
    tag = "Pipeline"
)]
pub async fn storage_event(State(state): State<AppState>, body: Bytes) -> Response {
    let notification: StorageNotification = match serde_json::from_slice(&body) {
        Ok(notification) => notification,
        Err(e) => return reject(&state, format!("malformed storage notification: {e}"), &body).await,
    };

    let mut outcomes = Vec::new();
    for record in &notification.records {
        let key = &record.s3.object.key;
        if !record.is_creation() {
            outcomes.push(EventOutcome::from_outcome(
                key,
                &Outcome::Ignored("not an object creation".to_string()),
            ));
            continue;
        }

        match state.pipeline.on_object_created(&record.s3.bucket.name, key).await {
            Ok(outcome) => {
                log_outcome(key, &outcome);
                outcomes.push(EventOutcome::from_outcome(key, &outcome));
            }
            // Records already handled are idempotent on redelivery.
            Err(e) if e.is_transient() => {
                warn!(key = %key, "Storage notification failed transiently: {}", e);
                return ApiError::unavailable(e.to_string()).into_response();
            }
            Err(e) => {
                error!(key = %key, "Storage notification failed: {}", e);
                park(&state, &e.to_string(), &body).await;
                outcomes.push(EventOutcome::failed(key, &e));
            }
        }
    }

    ApiSuccess::ok(outcomes, "Storage notification processed").into_response()
}

#[utoipa::path(
    post,
    path = "/api/v1/events/transcription",
    request_body = TranscriptionEvent,
    responses(
        (status = 200, description = "Handled, stale or ignored", body = ApiResponse<EventOutcome>),
        (status = 400, description = "Malformed event, dead-lettered"),
        (status = 503, description = "Transient failure, retry later")
    ),
    tag = "Pipeline"
)]
pub async fn transcription_event(State(state): State<AppState>, body: Bytes) -> Response {
    let event: TranscriptionEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => return reject(&state, format!("malformed transcription event: {e}"), &body).await,
    };
    if let Err(e) = event.validate() {
        return reject(&state, format!("invalid transcription event: {e}"), &body).await;
    }

    match state.pipeline.on_transcription_event(&event).await {
        Ok(outcome) => {
            log_outcome(&event.job_name, &outcome);
            ApiSuccess::ok(
                EventOutcome::from_outcome(&event.job_name, &outcome),
                "Transcription event processed",
            )
            .into_response()
        }
        Err(e) if e.is_transient() => {
            warn!(job = %event.job_name, "Transcription event failed transiently: {}", e);
            ApiError::unavailable(e.to_string()).into_response()
        }
        Err(e) => {
            error!(job = %event.job_name, "Transcription event failed: {}", e);
            park(&state, &e.to_string(), &body).await;
            ApiSuccess::ok(
                EventOutcome::failed(&event.job_name, &e),
                "Transcription event dead-lettered",
            )
            .into_response()
        }
    }
}
