use axum::{
    extract::{Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use super::auth::with_session;
use super::enrollment::read_recording;
use super::error::ApiError;
use super::middleware::FullAuth;
use crate::db::{AttemptListQuery, AttemptListResponse, AttemptResponse};
use crate::identification::{IdentificationResult, PollOutcome};
use crate::session::Claim;
use crate::AppState;

const DEFAULT_PAGE_SIZE: i64 = 20;

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    NotFound,
    Pending,
    Ready,
    Consumed,
    Identified,
    Rejected,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: PollStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<AttemptResponse>,
}

impl StatusResponse {
    fn bare(status: PollStatus) -> Json<Self> {
        Json(Self { status, attempt: None })
    }
}

/// POST /identification/attempts
pub async fn create_attempt(
    State(state): State<Arc<AppState>>,
    FullAuth { user, .. }: FullAuth,
    multipart: Multipart,
) -> Result<(StatusCode, Json<AttemptResponse>), ApiError> {
    let bytes = read_recording(multipart).await?;
    let attempt = state.identification.create(user, &bytes).await?;

    // A failed dispatch is picked up again by the next poll
    if let Err(e) = state.identification.dispatch(&attempt).await {
        tracing::warn!(attempt = %attempt.rid, error = %e, "Dispatch deferred to next poll");
    }

    Ok((StatusCode::ACCEPTED, Json(AttemptResponse::from(&attempt))))
}

/// GET /identification/attempts?cursor=&limit=
pub async fn list_attempts(
    State(state): State<Arc<AppState>>,
    FullAuth { user, .. }: FullAuth,
    Query(query): Query<AttemptListQuery>,
) -> Result<Json<AttemptListResponse>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 100);
    let attempts = state
        .identification
        .history(user, query.cursor.as_deref(), limit)
        .await?;

    let next_cursor = if attempts.len() as i64 == limit {
        attempts.last().map(|a| a.rid.clone())
    } else {
        None
    };
    Ok(Json(AttemptListResponse {
        items: attempts.iter().map(AttemptResponse::from).collect(),
        next_cursor,
    }))
}

/// GET /identification/poll
pub async fn poll(
    State(state): State<Arc<AppState>>,
    FullAuth { user, .. }: FullAuth,
) -> Result<Json<StatusResponse>, ApiError> {
    let response = match state.identification.poll_latest_for_user(user).await? {
        PollOutcome::NotFound => StatusResponse::bare(PollStatus::NotFound),
        PollOutcome::Pending => StatusResponse::bare(PollStatus::Pending),
        PollOutcome::AlreadyConsumed => StatusResponse::bare(PollStatus::Consumed),
        PollOutcome::Ready(attempt) => Json(StatusResponse {
            status: PollStatus::Ready,
            attempt: Some(AttemptResponse::from(&attempt)),
        }),
    };
    Ok(response)
}

/// POST /identification/result
///
/// A positive result re-issues the session so that it is marked as freshly
/// identified.
pub async fn result(
    State(state): State<Arc<AppState>>,
    FullAuth { user, .. }: FullAuth,
) -> Result<Response, ApiError> {
    match state.identification.result(user).await? {
        IdentificationResult::Pending => {
            Ok((StatusCode::ACCEPTED, StatusResponse::bare(PollStatus::Pending)).into_response())
        }
        IdentificationResult::Rejected(attempt) => Ok(Json(StatusResponse {
            status: PollStatus::Rejected,
            attempt: Some(AttemptResponse::from(&attempt)),
        })
        .into_response()),
        IdentificationResult::Identified(attempt) => {
            let claim = Claim::new(user, true, true, Utc::now());
            Ok(with_session(
                state.sessions.issue(&claim),
                Json(StatusResponse {
                    status: PollStatus::Identified,
                    attempt: Some(AttemptResponse::from(&attempt)),
                }),
            ))
        }
    }
}
