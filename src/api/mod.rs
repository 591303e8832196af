pub mod auth;
pub mod callbacks;
pub mod enrollment;
pub mod error;
pub mod identification;
pub mod metrics;
pub mod middleware;
pub mod rate_limit;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::enrollment::MAX_RECORDING_BYTES;
use crate::AppState;

/// Multipart framing on top of the largest accepted recording.
const MAX_BODY_BYTES: usize = MAX_RECORDING_BYTES + 1024 * 1024;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Credential and code endpoints
    let auth_routes = Router::new()
        .route("/auth/registerWithEmail", post(auth::register_with_email))
        .route(
            "/auth/requestNewEmailVerificationCode",
            post(auth::request_new_email_verification_code),
        )
        .route("/auth/verifyEmail", post(auth::verify_email))
        .route("/auth/loginWithEmail", post(auth::login_with_email))
        .route("/auth/requestPasswordReset", post(auth::request_password_reset))
        .route("/auth/resetPassword", post(auth::reset_password))
        .route("/auth/logout", post(auth::logout))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_auth,
        ));

    // Session-gated API; gates are applied per handler by extractor
    let api_routes = Router::new()
        .route(
            "/auth/account",
            get(auth::get_account).delete(auth::delete_account),
        )
        .route("/auth/invite", post(auth::invite))
        .route("/user/sentence", get(enrollment::get_sentence))
        .route(
            "/user/referenceRecording/:step",
            post(enrollment::submit_reference_recording),
        )
        .route("/user/enrollment", get(enrollment::get_enrollment))
        .route(
            "/identification/attempts",
            post(identification::create_attempt).get(identification::list_attempts),
        )
        .route("/identification/poll", get(identification::poll))
        .route("/identification/result", post(identification::result))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_api,
        ));

    // Page-style routes redirect instead of answering 401
    let view_routes = Router::new()
        .route("/account", get(auth::account_view))
        .layer(axum_middleware::from_fn(middleware::redirect_to_view));

    let callback_routes = Router::new()
        .route("/attempts/:rid", post(callbacks::attempt_outcome))
        .route(
            "/enrollments/:user_rid/:step",
            post(callbacks::enrollment_features),
        )
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_callback,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics::metrics_endpoint))
        .merge(auth_routes)
        .merge(api_routes)
        .merge(view_routes)
        .nest("/jobs/callback", callback_routes)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::session_layer,
        ))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(axum_middleware::from_fn(metrics::metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => (StatusCode::OK, "OK"),
        Err(e) => {
            tracing::error!("Health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "database unavailable")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::test_pool;
    use crate::jobs::fake::{FakeJobClient, Reply};
    use crate::session::Claim;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, Response};
    use chrono::Utc;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const BOUNDARY: &str = "voicegate-test-boundary";
    const CALLBACK_SECRET: &str = "callback-secret";

    async fn test_state() -> Arc<AppState> {
        let mut config = Config::default();
        config.jobs.callback_secret = Some(CALLBACK_SECRET.to_string());
        let jobs = Arc::new(FakeJobClient::new(Reply::Deferred));
        Arc::new(AppState::new(config, test_pool().await, jobs))
    }

    async fn send(state: &Arc<AppState>, request: Request<Body>) -> Response<Body> {
        create_router(state.clone()).oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response<Body>) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// `name=value` part of the session `Set-Cookie`, ready for a `Cookie` header.
    fn session_cookie(response: &Response<Body>) -> String {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| v.starts_with(crate::session::SESSION_COOKIE))
            .and_then(|v| v.split(';').next())
            .expect("session cookie")
            .to_string()
    }

    fn cookie_for(state: &AppState, claim: &Claim) -> String {
        let header = state.sessions.issue(claim).unwrap();
        header.to_str().unwrap().split(';').next().unwrap().to_string()
    }

    fn json_request(method: &str, uri: &str, cookie: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn upload(uri: &str, cookie: &str, bytes: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"recording\"; \
                 filename=\"clip.wav\"\r\nContent-Type: audio/wav\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .header(header::COOKIE, cookie)
            .body(Body::from(body))
            .unwrap()
    }

    /// Registered, verified user with a full-auth session cookie.
    async fn verified_user(state: &Arc<AppState>) -> String {
        let issued = state
            .auth
            .register(None, "speaker@example.com", "Sup3r$ecret", Utc::now())
            .await
            .unwrap();
        let cookie = cookie_for(state, &issued.claim);

        let response = send(
            state,
            json_request(
                "POST",
                "/auth/verifyEmail",
                Some(&cookie),
                json!({ "verification_code": issued.code }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        session_cookie(&response)
    }

    #[tokio::test]
    async fn test_health_check() {
        let state = test_state().await;
        let response = send(&state, get("/health", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_unavailable_without_recorder() {
        let state = test_state().await;
        let response = send(&state, get("/metrics", None)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_sentence_for_verified_user() {
        let state = test_state().await;
        let cookie = verified_user(&state).await;

        let response = send(&state, get("/user/sentence", Some(&cookie))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await["sentence"],
            "the early bird catches the worm"
        );
    }

    #[tokio::test]
    async fn test_gated_routes_reject_anonymous_callers() {
        let state = test_state().await;
        for uri in ["/user/enrollment", "/identification/poll", "/auth/account"] {
            let response = send(&state, get(uri, None)).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_view_redirects_follow_auth_state() {
        let state = test_state().await;

        let response = send(&state, get("/account", None)).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/login");

        let request = Request::builder()
            .uri("/account")
            .header("hx-request", "true")
            .body(Body::empty())
            .unwrap();
        let response = send(&state, request).await;
        assert_eq!(response.headers()["hx-redirect"], "/login");

        let response = send(
            &state,
            json_request(
                "POST",
                "/auth/registerWithEmail",
                None,
                json!({ "email": "new@example.com", "password": "Sup3r$ecret" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let cookie = session_cookie(&response);

        // Registration alone does not log the user in
        let response = send(&state, get("/account", Some(&cookie))).await;
        assert_eq!(response.headers()[header::LOCATION], "/login");

        let response = send(
            &state,
            json_request(
                "POST",
                "/auth/loginWithEmail",
                None,
                json!({ "email": "new@example.com", "password": "Sup3r$ecret" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = session_cookie(&response);

        let response = send(&state, get("/account", Some(&cookie))).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/verifyEmail");

        // Registered but unverified sessions are not enough for the API
        let response = send(&state, get("/user/enrollment", Some(&cookie))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_tampered_cookie_is_invalidated() {
        let state = test_state().await;
        let cookie = verified_user(&state).await;
        let tampered = format!("{cookie}x");

        let response = send(&state, get("/auth/account", Some(&tampered))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(set_cookie.contains("Max-Age=0"));

        let response = send(&state, get("/auth/account", Some(&cookie))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["email"], "speaker@example.com");
        assert_eq!(body["email_verified"], true);
    }

    #[tokio::test]
    async fn test_duplicate_registration_conflicts() {
        let state = test_state().await;
        let body = json!({ "email": "dup@example.com", "password": "Sup3r$ecret" });

        let first = send(&state, json_request("POST", "/auth/registerWithEmail", None, body.clone())).await;
        assert_eq!(first.status(), StatusCode::CREATED);

        let body = json!({ "email": "DUP@example.com", "password": "Sup3r$ecret" });
        let second = send(&state, json_request("POST", "/auth/registerWithEmail", None, body)).await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(second).await["error"]["code"], "conflict");
    }

    #[tokio::test]
    async fn test_invalid_step_is_rejected() {
        let state = test_state().await;
        let cookie = verified_user(&state).await;

        for step in ["0", "4", "two"] {
            let uri = format!("/user/referenceRecording/{step}");
            let response = send(&state, upload(&uri, &cookie, b"audio")).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{step}");
        }
        let response = send(&state, get("/user/enrollment", Some(&cookie))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_oversized_recordings_are_rejected() {
        let state = test_state().await;
        let cookie = verified_user(&state).await;

        // Just over the recording limit, inside the body limit
        let over_recording = vec![0u8; MAX_RECORDING_BYTES + 10];
        // Past the body limit, cut off while the multipart stream is read
        let over_body = vec![0u8; 7 * 1024 * 1024];

        for uri in ["/user/referenceRecording/1", "/identification/attempts"] {
            for bytes in [&over_recording, &over_body] {
                let response = send(&state, upload(uri, &cookie, bytes)).await;
                assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE, "{uri}");
                assert_eq!(json_body(response).await["error"]["code"], "payload_too_large");
            }
        }
        let response = send(&state, get("/user/enrollment", Some(&cookie))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_enrollment_then_identification_flow() {
        let state = test_state().await;
        let cookie = verified_user(&state).await;

        // Identification needs a complete enrollment
        let response = send(&state, upload("/identification/attempts", &cookie, b"challenge")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        for step in 1..=3 {
            let uri = format!("/user/referenceRecording/{step}");
            let mut request = upload(&uri, &cookie, b"reference audio");
            request
                .headers_mut()
                .insert("hx-request", "true".parse().unwrap());
            let response = send(&state, request).await;
            assert_eq!(response.status(), StatusCode::OK);
            let expected = if step < 3 {
                format!("/user/referenceRecording/{}", step + 1)
            } else {
                "/identification".to_string()
            };
            assert_eq!(response.headers()["hx-redirect"], expected.as_str());
        }

        let response = send(&state, get("/account", Some(&cookie))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["next_step"], Value::Null);

        let response = send(&state, upload("/identification/attempts", &cookie, b"challenge")).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let attempt = json_body(response).await;
        let rid = attempt["rid"].as_str().unwrap().to_string();

        let response = send(&state, get("/identification/poll", Some(&cookie))).await;
        assert_eq!(json_body(response).await["status"], "pending");

        let result = send(&state, json_request("POST", "/identification/result", Some(&cookie), json!({}))).await;
        assert_eq!(result.status(), StatusCode::ACCEPTED);

        // Signed write-back from the job service
        let payload = json!({ "identified": true, "feature_vector": [0.5, 0.25] }).to_string();
        let request = Request::builder()
            .method("POST")
            .uri(format!("/jobs/callback/attempts/{rid}"))
            .header(callbacks::SIGNATURE_HEADER, callbacks::sign(CALLBACK_SECRET, payload.as_bytes()))
            .body(Body::from(payload))
            .unwrap();
        let response = send(&state, request).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&state, get("/identification/poll", Some(&cookie))).await;
        assert_eq!(json_body(response).await["status"], "ready");

        let result = send(&state, json_request("POST", "/identification/result", Some(&cookie), json!({}))).await;
        assert_eq!(result.status(), StatusCode::OK);
        assert!(result.headers().get(header::SET_COOKIE).is_some());
        let body = json_body(result).await;
        assert_eq!(body["status"], "identified");
        assert_eq!(body["attempt"]["rid"], rid.as_str());

        let again = send(&state, json_request("POST", "/identification/result", Some(&cookie), json!({}))).await;
        assert_eq!(again.status(), StatusCode::CONFLICT);

        let response = send(&state, get("/identification/attempts?limit=1", Some(&cookie))).await;
        let page = json_body(response).await;
        assert_eq!(page["items"].as_array().unwrap().len(), 1);
        assert_eq!(page["next_cursor"], rid.as_str());

        let uri = format!("/identification/attempts?limit=1&cursor={rid}");
        let response = send(&state, get(&uri, Some(&cookie))).await;
        let page = json_body(response).await;
        assert!(page["items"].as_array().unwrap().is_empty());
        assert_eq!(page["next_cursor"], Value::Null);

        assert!(state.identification.find(&rid).await.unwrap().used_for_result);
    }

    #[tokio::test]
    async fn test_callbacks_require_valid_signature() {
        let state = test_state().await;
        let payload = json!({ "identified": true }).to_string();

        let request = Request::builder()
            .method("POST")
            .uri("/jobs/callback/attempts/unknown")
            .header(callbacks::SIGNATURE_HEADER, "sha256=00")
            .body(Body::from(payload.clone()))
            .unwrap();
        assert_eq!(send(&state, request).await.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .method("POST")
            .uri("/jobs/callback/attempts/unknown")
            .header(callbacks::SIGNATURE_HEADER, callbacks::sign(CALLBACK_SECRET, payload.as_bytes()))
            .body(Body::from(payload))
            .unwrap();
        assert_eq!(send(&state, request).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_callbacks_disabled_without_secret() {
        let config = Config::default();
        let jobs = Arc::new(FakeJobClient::new(Reply::Deferred));
        let state = Arc::new(AppState::new(config, test_pool().await, jobs));

        let payload = json!({ "identified": true }).to_string();
        let request = Request::builder()
            .method("POST")
            .uri("/jobs/callback/attempts/any")
            .header(callbacks::SIGNATURE_HEADER, callbacks::sign(CALLBACK_SECRET, payload.as_bytes()))
            .body(Body::from(payload))
            .unwrap();
        assert_eq!(send(&state, request).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_logout_clears_session() {
        let state = test_state().await;
        let cookie = verified_user(&state).await;

        let response = send(&state, json_request("POST", "/auth/logout", Some(&cookie), json!({}))).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let cleared = session_cookie(&response);
        assert!(response.headers()[header::SET_COOKIE]
            .to_str()
            .unwrap()
            .contains("Max-Age=0"));

        let response = send(&state, get("/auth/account", Some(&cleared))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
