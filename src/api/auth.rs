use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use super::error::ApiError;
use super::middleware::{Context, FullAuth, UnverifiedOk};
use crate::db::{
    AccountResponse, InviteRequest, InviteResponse, LoginRequest, PasswordResetRequest,
    ReferenceStep, RegisterRequest, ResetPasswordRequest, VerifyEmailRequest,
};
use crate::AppState;

/// Attach a session `Set-Cookie` to any response.
pub(crate) fn with_session(cookie: Option<HeaderValue>, body: impl IntoResponse) -> Response {
    let mut response = body.into_response();
    if let Some(cookie) = cookie {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    response
}

/// Codes leave the system out of band; only the fact of issuing is logged at info.
fn deliver_code(email: &str, purpose: &str, code: &str) {
    tracing::info!(email = %email, purpose, "One-time code issued");
    tracing::debug!(email = %email, purpose, code, "One-time code");
}

/// POST /auth/registerWithEmail
pub async fn register_with_email(
    State(state): State<Arc<AppState>>,
    Context(ctx): Context,
    Json(request): Json<RegisterRequest>,
) -> Result<Response, ApiError> {
    let issued = state
        .auth
        .register(ctx.project, &request.email, &request.password, Utc::now())
        .await?;
    deliver_code(&issued.record.email, "email_verification", &issued.code);

    let cookie = state.sessions.issue(&issued.claim);
    Ok(with_session(
        cookie,
        (StatusCode::CREATED, Json(AccountResponse::from(issued.record))),
    ))
}

/// POST /auth/requestNewEmailVerificationCode
pub async fn request_new_email_verification_code(
    State(state): State<Arc<AppState>>,
    UnverifiedOk { ctx, user }: UnverifiedOk,
) -> Result<StatusCode, ApiError> {
    let code = state
        .auth
        .request_verification_code(ctx.project, user, Utc::now())
        .await?;
    let account = state.auth.account(ctx.project, user).await?;
    deliver_code(&account.email, "email_verification", &code);
    Ok(StatusCode::NO_CONTENT)
}

/// POST /auth/verifyEmail
pub async fn verify_email(
    State(state): State<Arc<AppState>>,
    UnverifiedOk { ctx, user }: UnverifiedOk,
    Json(request): Json<VerifyEmailRequest>,
) -> Result<Response, ApiError> {
    let (record, claim) = state
        .auth
        .verify_email(ctx.project, user, &request.verification_code, Utc::now())
        .await?;

    Ok(with_session(
        state.sessions.issue(&claim),
        Json(AccountResponse::from(record)),
    ))
}

/// POST /auth/loginWithEmail
pub async fn login_with_email(
    State(state): State<Arc<AppState>>,
    Context(ctx): Context,
    Json(request): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let (record, claim) = state
        .auth
        .login(ctx.project, &request.email, &request.password, Utc::now())
        .await?;

    Ok(with_session(
        state.sessions.issue(&claim),
        Json(AccountResponse::from(record)),
    ))
}

/// POST /auth/requestPasswordReset
///
/// Always 202 so the response does not reveal whether the address exists.
pub async fn request_password_reset(
    State(state): State<Arc<AppState>>,
    Context(ctx): Context,
    Json(request): Json<PasswordResetRequest>,
) -> Result<Response, ApiError> {
    let issued = state
        .auth
        .request_password_reset(ctx.project, &request.email, Utc::now())
        .await?;

    let cookie = match issued {
        Some(issued) => {
            deliver_code(&issued.record.email, "password_reset", &issued.code);
            state.sessions.issue(&issued.claim)
        }
        None => None,
    };
    Ok(with_session(cookie, StatusCode::ACCEPTED))
}

/// POST /auth/resetPassword
pub async fn reset_password(
    State(state): State<Arc<AppState>>,
    UnverifiedOk { ctx, user }: UnverifiedOk,
    Json(request): Json<ResetPasswordRequest>,
) -> Result<Json<AccountResponse>, ApiError> {
    let record = state
        .auth
        .reset_password(ctx.project, user, &request, Utc::now())
        .await?;
    Ok(Json(AccountResponse::from(record)))
}

/// POST /auth/logout
pub async fn logout(State(state): State<Arc<AppState>>) -> Response {
    let claim = state.auth.logout(Utc::now());
    with_session(state.sessions.invalidate(&claim), StatusCode::NO_CONTENT)
}

/// GET /auth/account
pub async fn get_account(
    State(state): State<Arc<AppState>>,
    FullAuth { ctx, user }: FullAuth,
) -> Result<Json<AccountResponse>, ApiError> {
    let record = state.auth.account(ctx.project, user).await?;
    Ok(Json(AccountResponse::from(record)))
}

/// DELETE /auth/account
pub async fn delete_account(
    State(state): State<Arc<AppState>>,
    FullAuth { ctx, user }: FullAuth,
) -> Result<Response, ApiError> {
    state.auth.delete_account(ctx.project, user).await?;
    let claim = state.auth.logout(Utc::now());
    Ok(with_session(
        state.sessions.invalidate(&claim),
        StatusCode::NO_CONTENT,
    ))
}

/// POST /auth/invite
pub async fn invite(
    State(state): State<Arc<AppState>>,
    FullAuth { ctx, user }: FullAuth,
    Json(request): Json<InviteRequest>,
) -> Result<(StatusCode, Json<InviteResponse>), ApiError> {
    let (record, temporary_password) = state
        .auth
        .invite(ctx.project, &request.email, Utc::now())
        .await?;
    tracing::info!(invited_by = %user, account = %record.rid, "Account invited");

    Ok((
        StatusCode::CREATED,
        Json(InviteResponse {
            account: AccountResponse::from(record),
            temporary_password,
        }),
    ))
}

#[derive(Serialize)]
pub struct AccountView {
    #[serde(flatten)]
    pub account: AccountResponse,
    /// Reference recording to capture next; absent once enrolled
    pub next_step: Option<u8>,
}

/// GET /account, served behind `redirect_to_view`.
pub async fn account_view(
    State(state): State<Arc<AppState>>,
    Context(ctx): Context,
) -> Result<Json<AccountView>, ApiError> {
    let user = ctx
        .user()
        .ok_or_else(|| ApiError::unauthorized("Not logged in"))?;
    let record = state.auth.account(ctx.project, user).await?;
    let next_step = state.enrollment.next_step(user).await?;

    Ok(Json(AccountView {
        account: AccountResponse::from(record),
        next_step: next_step.map(ReferenceStep::number),
    }))
}
