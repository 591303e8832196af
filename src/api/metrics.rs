//! Prometheus metrics endpoint and HTTP request tracking middleware.
//!
//! Besides per-request counters this module owns the names of the domain
//! counters recorded by the coordinators, so every series is described in one
//! place.

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;

use crate::AppState;

pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const IDENTIFICATION_ATTEMPTS_TOTAL: &str = "voicegate_identification_attempts_total";
pub const REFERENCE_RECORDINGS_TOTAL: &str = "voicegate_reference_recordings_total";
pub const AUTH_EVENTS_TOTAL: &str = "voicegate_auth_events_total";
pub const JOB_REQUEST_DURATION_SECONDS: &str = "voicegate_job_request_duration_seconds";

/// Install the Prometheus recorder. Call once during startup.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request duration in seconds");
    describe_counter!(
        IDENTIFICATION_ATTEMPTS_TOTAL,
        "Identification attempts by lifecycle stage"
    );
    describe_counter!(REFERENCE_RECORDINGS_TOTAL, "Reference recordings stored by step");
    describe_counter!(AUTH_EVENTS_TOTAL, "Account events by kind");
    describe_histogram!(
        JOB_REQUEST_DURATION_SECONDS,
        "Matching job service request duration in seconds"
    );

    Ok(handle)
}

/// GET /metrics
pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics_handle.as_ref() {
        Some(h) => (StatusCode::OK, h.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Metrics not initialized".to_string(),
        ),
    }
}

/// Records `http_requests_total` and `http_request_duration_seconds` per matched route.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();

    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let method = request.method().to_string();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

/// Stage is one of `created`, `dispatched`, `dispatch_failed`, `identified`,
/// `rejected`, `consumed`.
pub fn record_attempt_stage(stage: &'static str) {
    counter!(IDENTIFICATION_ATTEMPTS_TOTAL, "stage" => stage).increment(1);
}

pub fn record_reference_recording(step: u8) {
    counter!(REFERENCE_RECORDINGS_TOTAL, "step" => step.to_string()).increment(1);
}

pub fn record_auth_event(event: &'static str) {
    counter!(AUTH_EVENTS_TOTAL, "event" => event).increment(1);
}

pub fn record_job_request(path: &str, seconds: f64) {
    histogram!(JOB_REQUEST_DURATION_SECONDS, "path" => path.to_string()).record(seconds);
}
