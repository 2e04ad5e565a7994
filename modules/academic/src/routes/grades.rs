//! Grade submission API
//!
//! `POST /api/grades/choreography` stamps the grade and publishes it to the
//! grades exchange. The response is sent once the broker accepted the frame;
//! notification delivery happens asynchronously in the notification worker.

use amqp_bus::{BusError, TraceContext, TRACEPARENT_HEADER};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use grade_contracts::{routing_key, ContractError, GradeEvent, GradeSubmission};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

pub const UNAVAILABLE_MESSAGE: &str = "Notification service temporarily unavailable";

/// Error body returned to clients
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Errors a grade submission can end in
#[derive(Debug, thiserror::Error)]
pub enum SubmitGradeError {
    #[error(transparent)]
    Invalid(#[from] ContractError),

    #[error("Notification service temporarily unavailable")]
    Unavailable(#[source] BusError),
}

impl SubmitGradeError {
    fn status(&self) -> StatusCode {
        match self {
            SubmitGradeError::Invalid(_) => StatusCode::BAD_REQUEST,
            SubmitGradeError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for SubmitGradeError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (self.status(), body).into_response()
    }
}

/// Trace the request belongs to, taken from the caller's `traceparent`
///
/// `None` makes the publish span the root of a new trace.
fn request_trace(headers: &HeaderMap) -> Option<TraceContext> {
    headers
        .get(TRACEPARENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(TraceContext::parse)
}

/// Handler for POST /api/grades/choreography
///
/// Returns `202 Accepted` with the stamped event, `400` for a submission
/// without student name or subject, `503` when the broker is unavailable.
pub async fn submit_grade_choreography(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(submission): Json<GradeSubmission>,
) -> Result<(StatusCode, Json<GradeEvent>), SubmitGradeError> {
    submission.validate()?;

    let trace = request_trace(&headers);
    let trace_id = trace.as_ref().map(TraceContext::trace_id);
    let routing_key = routing_key(&state.routing_domain, &submission.subject);
    let student_name = submission.student_name.clone();

    let event = state
        .producer
        .publish(submission, &state.exchange, &routing_key, trace.as_ref())
        .await
        .map_err(|e| {
            tracing::error!(
                trace_id = ?trace_id,
                exchange = %state.exchange,
                routing_key = %routing_key,
                error = %e,
                "Failed to publish grade event"
            );
            SubmitGradeError::Unavailable(e)
        })?;

    tracing::info!(
        trace_id = ?trace_id,
        student_name = %student_name,
        routing_key = %routing_key,
        "Grade accepted (choreography)"
    );

    Ok((StatusCode::ACCEPTED, Json(event)))
}
