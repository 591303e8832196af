//! Auth records: credentials and verification state per identity.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::Record;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuthRecord {
    #[serde(skip)]
    pub id: i64,
    pub rid: String,
    pub email: String,
    pub email_verified: bool,
    #[serde(skip)]
    pub password_hash: String,
    #[serde(skip)]
    pub password_temp_hash: Option<String>,
    #[serde(skip)]
    pub password_temp_request_date: Option<String>,
    #[serde(skip)]
    pub password_reset_code_hash: Option<String>,
    #[serde(skip)]
    pub password_reset_request_date: Option<String>,
    #[serde(skip)]
    pub email_verification_code_hash: Option<String>,
    #[serde(skip)]
    pub email_verification_request_date: Option<String>,
    #[serde(skip)]
    pub password_reset_failures: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl AuthRecord {
    pub fn has_temp_password(&self) -> bool {
        self.password_temp_hash
            .as_deref()
            .is_some_and(|hash| !hash.is_empty())
    }
}

impl Record for AuthRecord {
    const TABLE: &'static str = "auth_main";
    const NAME: &'static str = "account";
    const COLUMNS: &'static str = "id, rid, email, email_verified, password_hash, \
        password_temp_hash, password_temp_request_date, password_reset_code_hash, \
        password_reset_request_date, email_verification_code_hash, \
        email_verification_request_date, password_reset_failures, created_at, updated_at";
}

/// Public view of an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountResponse {
    pub rid: String,
    pub email: String,
    pub email_verified: bool,
    pub password_temp_valid: bool,
    pub created_at: String,
}

impl From<AuthRecord> for AccountResponse {
    fn from(record: AuthRecord) -> Self {
        Self {
            password_temp_valid: record.has_temp_password(),
            rid: record.rid,
            email: record.email,
            email_verified: record.email_verified,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailRequest {
    pub verification_code: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub new_password: String,
    pub new_password_confirmed: String,
    pub verification_code: String,
}

#[derive(Debug, Deserialize)]
pub struct InviteRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct InviteResponse {
    pub account: AccountResponse,
    pub temporary_password: String,
}
