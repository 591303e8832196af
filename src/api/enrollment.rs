use axum::{
    extract::{multipart::MultipartError, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use super::error::ApiError;
use super::middleware::FullAuth;
use crate::db::{EnrollmentResponse, ReferenceStep};
use crate::enrollment::MAX_RECORDING_BYTES;
use crate::error::ValidationError;
use crate::AppState;

pub const RECORDING_FIELD: &str = "recording";

/// Pull the `recording` part out of a multipart upload.
pub(crate) async fn read_recording(mut multipart: Multipart) -> Result<Vec<u8>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error("Invalid multipart body", e))?
    {
        if field.name() == Some(RECORDING_FIELD) {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| multipart_error("Failed to read recording", e))?;
            return Ok(bytes.to_vec());
        }
    }
    Err(ApiError::validation_field(RECORDING_FIELD, "Recording is required"))
}

/// Body limit hits surface from the multipart stream; keep them 413.
fn multipart_error(context: &str, err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::payload_too_large(MAX_RECORDING_BYTES)
    } else {
        ApiError::bad_request(format!("{context}: {err}"))
    }
}

#[derive(Serialize)]
pub struct SentenceResponse {
    pub sentence: String,
}

/// GET /user/sentence
pub async fn get_sentence(
    State(state): State<Arc<AppState>>,
    _auth: FullAuth,
) -> Result<Json<SentenceResponse>, ApiError> {
    let sentence = state.jobs.request_sentence().await?;
    Ok(Json(SentenceResponse { sentence }))
}

/// POST /user/referenceRecording/:step
pub async fn submit_reference_recording(
    State(state): State<Arc<AppState>>,
    FullAuth { ctx, user }: FullAuth,
    Path(step): Path<String>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    // Reject a bad step before reading the upload
    let step: i64 = step
        .parse()
        .map_err(|_| ApiError::validation_field("step", format!("Invalid reference step: {step}")))?;
    ReferenceStep::try_from(step).map_err(ValidationError::InvalidStep)?;

    let bytes = read_recording(multipart).await?;
    let enrollment = state
        .enrollment
        .submit_reference_recording(user, step, &bytes)
        .await?;

    let body = EnrollmentResponse::from(&enrollment);
    let next = match body.next_step {
        Some(next) => format!("/user/referenceRecording/{next}"),
        None => "/identification".to_string(),
    };
    let mut response = Json(body).into_response();
    if ctx.hx {
        if let Ok(value) = next.parse() {
            response.headers_mut().insert("hx-redirect", value);
        }
    }
    Ok(response)
}

/// GET /user/enrollment
pub async fn get_enrollment(
    State(state): State<Arc<AppState>>,
    FullAuth { user, .. }: FullAuth,
) -> Result<Json<EnrollmentResponse>, ApiError> {
    let enrollment = state
        .enrollment
        .enrollment(user)
        .await?
        .ok_or_else(|| ApiError::not_found("No reference recordings yet"))?;
    Ok(Json(EnrollmentResponse::from(&enrollment)))
}
