//! Signed session cookie handling.
//!
//! The cookie carries the claim set itself: `base64url(json) "." base64url(hmac)`.
//! Decoding never fails. Anything that is not a complete, correctly signed,
//! unexpired claim degrades to the anonymous session, and the caller is told to
//! reissue the cookie with `Max-Age=0`.

use axum::http::{HeaderMap, HeaderValue};
use axum_extra::extract::cookie::{Cookie, SameSite};
use axum_extra::extract::CookieJar;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::config::SessionConfig;

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_COOKIE: &str = "voicegate_session";

/// Decoded, typed contents of a session cookie. Every field is optional on the
/// wire; `validate` decides whether the set is trustworthy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    /// Unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl Claim {
    pub fn new(user_id: Uuid, authenticated: bool, email_verified: bool, now: DateTime<Utc>) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            authenticated: Some(authenticated),
            email_verified: Some(email_verified),
            created_at: Some(now.timestamp()),
        }
    }

    /// The claim written on logout: complete, but carrying no identity.
    pub fn logged_out(now: DateTime<Utc>) -> Self {
        Self {
            user_id: Some(String::new()),
            authenticated: Some(false),
            email_verified: Some(false),
            created_at: Some(now.timestamp()),
        }
    }

    fn is_complete(&self) -> bool {
        self.user_id.is_some()
            && self.authenticated.is_some()
            && self.email_verified.is_some()
            && self.created_at.is_some()
    }
}

/// Why a claim was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    MissingField(&'static str),
    MalformedUserId,
    Expired,
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "missing field {field}"),
            Self::MalformedUserId => write!(f, "malformed user id"),
            Self::Expired => write!(f, "session expired"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub reason: Option<InvalidReason>,
}

impl Validation {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn invalid(reason: InvalidReason) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
        }
    }
}

/// Check a claim for completeness and age.
pub fn validate(claim: &Claim, now: DateTime<Utc>, max_age: Duration) -> Validation {
    let Some(user_id) = claim.user_id.as_deref() else {
        return Validation::invalid(InvalidReason::MissingField("user_id"));
    };
    if claim.authenticated.is_none() {
        return Validation::invalid(InvalidReason::MissingField("authenticated"));
    }
    if claim.email_verified.is_none() {
        return Validation::invalid(InvalidReason::MissingField("email_verified"));
    }
    let Some(created_at) = claim.created_at else {
        return Validation::invalid(InvalidReason::MissingField("created_at"));
    };
    if !user_id.is_empty() && Uuid::parse_str(user_id).is_err() {
        return Validation::invalid(InvalidReason::MalformedUserId);
    }
    if now.timestamp() - created_at > max_age.num_seconds() {
        return Validation::invalid(InvalidReason::Expired);
    }
    Validation::ok()
}

/// Authentication state derived from a validated claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Anonymous,
    /// Identity known, email not verified or not logged in yet.
    Registered,
    Verified,
}

/// A validated session, safe to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: Option<Uuid>,
    pub authenticated: bool,
    pub email_verified: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            authenticated: false,
            email_verified: false,
            created_at: None,
        }
    }

    pub fn state(&self) -> AuthState {
        match self.user_id {
            None => AuthState::Anonymous,
            Some(_) if self.authenticated && self.email_verified => AuthState::Verified,
            Some(_) => AuthState::Registered,
        }
    }

    /// Only called on claims that passed `validate`.
    fn from_valid_claim(claim: &Claim) -> Self {
        let user_id = claim
            .user_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .and_then(|id| Uuid::parse_str(id).ok());
        Self {
            user_id,
            authenticated: claim.authenticated.unwrap_or(false),
            email_verified: claim.email_verified.unwrap_or(false),
            created_at: claim
                .created_at
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
        }
    }
}

/// Result of decoding a raw cookie value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub claim: Claim,
    /// The client holds a cookie that must be replaced with an invalidating one.
    pub reissue: bool,
}

/// Result of decoding and validating the cookie of one request.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub session: Session,
    pub validation: Validation,
    /// `Set-Cookie` value to attach to the response, if any.
    pub set_cookie: Option<HeaderValue>,
}

/// Signs, verifies and renders session cookies. Built once at startup.
#[derive(Clone)]
pub struct SessionCodec {
    mac: HmacSha256,
    max_age: Duration,
    secure: bool,
}

impl std::fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCodec")
            .field("max_age", &self.max_age)
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}

impl SessionCodec {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            mac: HmacSha256::new_from_slice(config.secret.as_bytes())
                .expect("HMAC accepts keys of any length"),
            max_age: Duration::seconds(config.max_age_seconds),
            secure: config.cookie_secure,
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    fn mac(&self) -> HmacSha256 {
        self.mac.clone()
    }

    pub fn encode(&self, claim: &Claim) -> String {
        let payload = serde_json::to_vec(claim).unwrap_or_default();
        let payload = URL_SAFE_NO_PAD.encode(payload);
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{payload}.{signature}")
    }

    /// Decode a raw cookie value. Never errors.
    pub fn decode(&self, raw: Option<&str>) -> Decoded {
        let Some(raw) = raw else {
            return Decoded {
                claim: Claim::default(),
                reissue: false,
            };
        };

        match self.verify(raw) {
            Some(claim) => {
                let reissue = !claim.is_complete();
                Decoded { claim, reissue }
            }
            None => {
                tracing::debug!("Discarding session cookie with bad signature or encoding");
                Decoded {
                    claim: Claim::default(),
                    reissue: true,
                }
            }
        }
    }

    fn verify(&self, raw: &str) -> Option<Claim> {
        let (payload, signature) = raw.split_once('.')?;
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        // Constant-time comparison
        mac.verify_slice(&signature).ok()?;
        let json = URL_SAFE_NO_PAD.decode(payload).ok()?;
        serde_json::from_slice(&json).ok()
    }

    /// Decode and validate the session cookie found in `headers`.
    pub fn resolve(&self, headers: &HeaderMap, now: DateTime<Utc>) -> Resolved {
        let jar = CookieJar::from_headers(headers);
        let raw = jar.get(SESSION_COOKIE).map(|c| c.value().to_string());
        let decoded = self.decode(raw.as_deref());
        let validation = validate(&decoded.claim, now, self.max_age);

        if validation.valid {
            return Resolved {
                session: Session::from_valid_claim(&decoded.claim),
                validation,
                set_cookie: None,
            };
        }

        // Only touch the client's cookie when it actually sent one
        let set_cookie = if raw.is_some() || decoded.reissue {
            tracing::debug!(reason = ?validation.reason, "Invalidating session cookie");
            self.invalidate(&decoded.claim)
        } else {
            None
        };

        Resolved {
            session: Session::anonymous(),
            validation,
            set_cookie,
        }
    }

    /// `Set-Cookie` for a fresh claim.
    pub fn issue(&self, claim: &Claim) -> Option<HeaderValue> {
        self.cookie_header(self.encode(claim), self.max_age.num_seconds())
    }

    /// `Set-Cookie` that flips `authenticated` off and tells the client to drop the cookie.
    pub fn invalidate(&self, claim: &Claim) -> Option<HeaderValue> {
        let mut claim = claim.clone();
        claim.authenticated = Some(false);
        self.cookie_header(self.encode(&claim), 0)
    }

    fn cookie_header(&self, value: String, max_age: i64) -> Option<HeaderValue> {
        let cookie = Cookie::build((SESSION_COOKIE, value))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .max_age(time::Duration::seconds(max_age))
            .secure(self.secure)
            .build();
        HeaderValue::from_str(&cookie.to_string()).ok()
    }
}
