//! Signed write-backs from the matching job service.
//!
//! Each request carries `X-Voicegate-Signature: sha256=<hex>`, an HMAC-SHA256
//! of the raw body under `jobs.callback_secret`. Without a configured secret
//! the endpoints do not exist.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use std::sync::Arc;
use uuid::Uuid;

use super::error::ApiError;
use crate::db::{AttemptResponse, EnrollmentResponse};
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-voicegate-signature";

fn verify_signature(secret: &str, signature_header: &str, payload: &[u8]) -> bool {
    let Some(signature) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    let computed = mac.finalize().into_bytes();
    computed.as_slice().ct_eq(&expected).into()
}

/// Check the signature and decode the body.
fn authenticate<T: DeserializeOwned>(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<T, ApiError> {
    let Some(secret) = state.config.jobs.callback_secret.as_deref() else {
        return Err(ApiError::not_found("Not found"));
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Missing signature"))?;
    if !verify_signature(secret, signature, body) {
        tracing::warn!("Rejected job callback with invalid signature");
        return Err(ApiError::unauthorized("Invalid signature"));
    }

    serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request(format!("Invalid callback payload: {e}")))
}

#[derive(Debug, Deserialize)]
pub struct AttemptCallback {
    pub identified: bool,
    #[serde(default)]
    pub feature_vector: Option<Vec<f64>>,
}

/// POST /jobs/callback/attempts/:rid
pub async fn attempt_outcome(
    State(state): State<Arc<AppState>>,
    Path(rid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AttemptResponse>, ApiError> {
    let payload: AttemptCallback = authenticate(&state, &headers, &body)?;
    let attempt = state
        .identification
        .resolve(&rid, payload.identified, payload.feature_vector)
        .await?;
    Ok(Json(AttemptResponse::from(&attempt)))
}

#[derive(Debug, Deserialize)]
pub struct EnrollmentCallback {
    /// Base64 normalised audio
    #[serde(default)]
    pub normalised: Option<String>,
    pub mfcc: Vec<f64>,
}

/// POST /jobs/callback/enrollments/:user_rid/:step
pub async fn enrollment_features(
    State(state): State<Arc<AppState>>,
    Path((user_rid, step)): Path<(Uuid, i64)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<EnrollmentResponse>, ApiError> {
    let payload: EnrollmentCallback = authenticate(&state, &headers, &body)?;
    let normalised = payload
        .normalised
        .map(|encoded| STANDARD.decode(encoded))
        .transpose()
        .map_err(|_| ApiError::validation_field("normalised", "Must be base64"))?;

    let enrollment = state
        .enrollment
        .backfill_features(user_rid, step, normalised, &payload.mfcc)
        .await?;
    Ok(Json(EnrollmentResponse::from(&enrollment)))
}

#[cfg(test)]
pub(crate) fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_verification() {
        let payload = br#"{"identified":true}"#;
        let header = sign("secret", payload);

        assert!(verify_signature("secret", &header, payload));
        assert!(!verify_signature("other", &header, payload));
        assert!(!verify_signature("secret", &header, b"{}"));
        assert!(!verify_signature("secret", header.trim_start_matches("sha256="), payload));
        assert!(!verify_signature("secret", "sha256=zz", payload));
    }

    #[test]
    fn test_callback_payloads() {
        let attempt: AttemptCallback = serde_json::from_str(r#"{"identified":false}"#).unwrap();
        assert!(!attempt.identified);
        assert!(attempt.feature_vector.is_none());

        let enrollment: EnrollmentCallback =
            serde_json::from_str(r#"{"normalised":"AAEC","mfcc":[0.5]}"#).unwrap();
        assert_eq!(STANDARD.decode(enrollment.normalised.unwrap()).unwrap(), vec![0, 1, 2]);
    }
}
