//! Session layer and access gates.
//!
//! `session_layer` resolves the cookie once per request and stores a
//! [`RequestContext`] in the request extensions. Handlers then pick a gate by
//! extractor type: [`FullAuth`] needs a verified, authenticated session and
//! [`UnverifiedOk`] only needs a known identity. Page-style routes use
//! [`redirect_to_view`] instead, which sends the browser to the right screen.

use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::Cookie;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use super::error::ApiError;
use crate::session::{AuthState, Session, SESSION_COOKIE};
use crate::AppState;

pub const PROJECT_HEADER: &str = "x-project-id";

/// Typed per-request data produced by the session layer.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub session: Session,
    /// Tenant scope for auth tables
    pub project: Option<Uuid>,
    /// Request issued by htmx (`HX-Request: true`)
    pub hx: bool,
}

impl RequestContext {
    pub fn user(&self) -> Option<Uuid> {
        self.session.user_id
    }
}

fn project_from(headers: &HeaderMap) -> Result<Option<Uuid>, ApiError> {
    match headers.get(PROJECT_HEADER) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .map(Some)
            .ok_or_else(|| ApiError::validation_field("X-Project-Id", "Project id must be a UUID")),
    }
}

/// Resolve the session cookie and attach a [`RequestContext`].
///
/// When the cookie had to be invalidated, the invalidating `Set-Cookie` is
/// appended unless the handler already wrote a fresh session cookie.
pub async fn session_layer(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let resolved = state.sessions.resolve(request.headers(), Utc::now());
    let project = match project_from(request.headers()) {
        Ok(project) => project,
        Err(err) => return err.into_response(),
    };
    let hx = request
        .headers()
        .get("hx-request")
        .is_some_and(|v| v.as_bytes() == b"true");

    request.extensions_mut().insert(RequestContext {
        session: resolved.session,
        project,
        hx,
    });

    let mut response = next.run(request).await;

    if let Some(cookie) = resolved.set_cookie {
        if !writes_session_cookie(response.headers()) {
            response.headers_mut().append(header::SET_COOKIE, cookie);
        }
    }
    response
}

fn writes_session_cookie(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| Cookie::parse(v).ok())
        .any(|cookie| cookie.name() == SESSION_COOKIE)
}

fn context(parts: &Parts) -> Result<RequestContext, ApiError> {
    parts
        .extensions
        .get::<RequestContext>()
        .cloned()
        .ok_or_else(|| ApiError::internal("Session layer missing"))
}

/// Verified and authenticated caller.
#[derive(Debug, Clone)]
pub struct FullAuth {
    pub ctx: RequestContext,
    pub user: Uuid,
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for FullAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ctx = context(parts)?;
        match (ctx.session.state(), ctx.user()) {
            (AuthState::Verified, Some(user)) => Ok(Self { ctx, user }),
            _ => Err(ApiError::unauthorized("Not logged in")),
        }
    }
}

/// Any caller with a known identity, verified or not.
#[derive(Debug, Clone)]
pub struct UnverifiedOk {
    pub ctx: RequestContext,
    pub user: Uuid,
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for UnverifiedOk {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ctx = context(parts)?;
        match ctx.user() {
            Some(user) => Ok(Self { ctx, user }),
            None => Err(ApiError::unauthorized("Not logged in")),
        }
    }
}

/// The session context with no gate applied.
#[derive(Debug, Clone)]
pub struct Context(pub RequestContext);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Context {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        context(parts).map(Context)
    }
}

/// `303 See Other` to `location`, mirrored in `HX-Redirect` for htmx callers.
pub fn redirect(location: &str, hx: bool) -> Response {
    let mut response = StatusCode::SEE_OTHER.into_response();
    if let Ok(value) = HeaderValue::from_str(location) {
        if hx {
            response.headers_mut().insert("hx-redirect", value.clone());
        }
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

/// Gate for page-style routes: unauthenticated callers go to `/login`,
/// unverified ones to `/verifyEmail`.
pub async fn redirect_to_view(request: Request<Body>, next: Next) -> Response {
    let Some(ctx) = request.extensions().get::<RequestContext>() else {
        return ApiError::internal("Session layer missing").into_response();
    };

    let session = &ctx.session;
    if session.user_id.is_none() || !session.authenticated {
        return redirect("/login", ctx.hx);
    }
    if !session.email_verified {
        return redirect("/verifyEmail", ctx.hx);
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(project_from(&headers).unwrap(), None);

        let id = Uuid::new_v4();
        headers.insert(PROJECT_HEADER, HeaderValue::from_str(&id.to_string()).unwrap());
        assert_eq!(project_from(&headers).unwrap(), Some(id));

        headers.insert(PROJECT_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert_eq!(project_from(&headers).unwrap_err().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_detects_handler_session_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(header::SET_COOKIE, HeaderValue::from_static("other=1; Path=/"));
        headers.append(
            header::SET_COOKIE,
            HeaderValue::from_str(&format!("{SESSION_COOKIE}_old=1; Path=/")).unwrap(),
        );
        assert!(!writes_session_cookie(&headers));

        headers.append(
            header::SET_COOKIE,
            HeaderValue::from_str(&format!("{SESSION_COOKIE}=abc; Path=/")).unwrap(),
        );
        assert!(writes_session_cookie(&headers));
    }

    #[test]
    fn test_redirect_sets_hx_header_only_for_htmx() {
        let response = redirect("/login", false);
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/login");
        assert!(response.headers().get("hx-redirect").is_none());

        let response = redirect("/verifyEmail", true);
        assert_eq!(response.headers()["hx-redirect"], "/verifyEmail");
    }
}
