//! Account lifecycle: registration, verification, login and password reset.
//!
//! Every operation that changes who the caller is returns the [`Claim`] the
//! session cookie should carry afterwards. Writing the cookie is left to the
//! HTTP layer.

pub mod password;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::api::metrics::record_auth_event;
use crate::config::AuthConfig;
use crate::db::{
    parse_timestamp, timestamp, AuthRecord, DbPool, Enrollment, IdentificationAttempt, Record,
    Repository, ResetPasswordRequest, TenantTables,
};
use crate::error::{Error, Result, ValidationError};
use crate::session::Claim;

use password::{
    hash_password, normalize_email, reset_code, temporary_password, validate_password_strength,
    verification_code, verify_dummy, verify_password,
};

/// A freshly issued one-time code. Delivery happens out of band.
#[derive(Debug)]
pub struct CodeIssued {
    pub record: AuthRecord,
    pub claim: Claim,
    pub code: String,
}

pub struct AuthService {
    pool: DbPool,
    tenants: Arc<TenantTables>,
    config: AuthConfig,
}

impl AuthService {
    pub fn new(pool: DbPool, tenants: Arc<TenantTables>, config: AuthConfig) -> Self {
        Self {
            pool,
            tenants,
            config,
        }
    }

    async fn store(&self, project: Option<Uuid>) -> Result<Repository<AuthRecord>> {
        let table = self.tenants.auth_table(project).await?;
        Ok(Repository::with_table(self.pool.clone(), table))
    }

    async fn load(&self, store: &Repository<AuthRecord>, user: Uuid) -> Result<AuthRecord> {
        store
            .find_by_rid(&user.to_string())
            .await?
            .ok_or(Error::NotFound(AuthRecord::NAME))
    }

    fn still_valid(requested: Option<&str>, ttl: Duration, now: DateTime<Utc>) -> bool {
        requested
            .and_then(parse_timestamp)
            .is_some_and(|at| now - at <= ttl)
    }

    pub async fn register(
        &self,
        project: Option<Uuid>,
        email: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<CodeIssued> {
        let email = normalize_email(email)?;
        validate_password_strength("password", password)?;

        let store = self.store(project).await?;
        if store.find_where("email", &email).await?.is_some() {
            return Err(Error::DuplicateEmail);
        }

        let code = verification_code();
        let rid = Uuid::new_v4();
        let ts = timestamp(now);
        let sql = format!(
            "INSERT INTO {} (rid, email, email_verified, password_hash, \
             email_verification_code_hash, email_verification_request_date, created_at, updated_at) \
             VALUES (?, ?, 0, ?, ?, ?, ?, ?) RETURNING {}",
            store.table(),
            AuthRecord::COLUMNS
        );
        let record = sqlx::query_as::<_, AuthRecord>(&sql)
            .bind(rid.to_string())
            .bind(&email)
            .bind(hash_password(password)?)
            .bind(hash_password(&code)?)
            .bind(&ts)
            .bind(&ts)
            .bind(&ts)
            .fetch_one(store.pool())
            .await
            .map_err(unique_to_duplicate)?;

        tracing::info!(user = %rid, "Registered account");
        record_auth_event("register");

        Ok(CodeIssued {
            record,
            claim: Claim::new(rid, false, false, now),
            code,
        })
    }

    pub async fn request_verification_code(
        &self,
        project: Option<Uuid>,
        user: Uuid,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let store = self.store(project).await?;
        let record = self.load(&store, user).await?;
        if record.email_verified {
            return Err(Error::validation("email", "Email already verified"));
        }

        let code = verification_code();
        let ts = timestamp(now);
        let sql = format!(
            "UPDATE {} SET email_verification_code_hash = ?, email_verification_request_date = ?, \
             updated_at = ? WHERE rid = ?",
            store.table()
        );
        sqlx::query(&sql)
            .bind(hash_password(&code)?)
            .bind(&ts)
            .bind(&ts)
            .bind(&record.rid)
            .execute(store.pool())
            .await?;

        tracing::info!(user = %user, "Issued new email verification code");
        Ok(code)
    }

    pub async fn verify_email(
        &self,
        project: Option<Uuid>,
        user: Uuid,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<(AuthRecord, Claim)> {
        let store = self.store(project).await?;
        let record = self.load(&store, user).await?;
        if record.email_verified {
            return Err(Error::validation("verification_code", "Email already verified"));
        }

        let ttl = Duration::minutes(self.config.verification_code_ttl_minutes);
        let Some(stored_hash) = record.email_verification_code_hash.as_deref() else {
            return Err(Error::InvalidCode);
        };
        if !Self::still_valid(record.email_verification_request_date.as_deref(), ttl, now)
            || !verify_password(code.trim(), stored_hash)
        {
            return Err(Error::InvalidCode);
        }

        // Conditional on the hash we checked, so a code is consumed at most once
        let sql = format!(
            "UPDATE {} SET email_verified = 1, email_verification_code_hash = NULL, \
             email_verification_request_date = NULL, updated_at = ? \
             WHERE rid = ? AND email_verification_code_hash = ? RETURNING {}",
            store.table(),
            AuthRecord::COLUMNS
        );
        let record = sqlx::query_as::<_, AuthRecord>(&sql)
            .bind(timestamp(now))
            .bind(&record.rid)
            .bind(stored_hash)
            .fetch_optional(store.pool())
            .await?
            .ok_or(Error::InvalidCode)?;

        tracing::info!(user = %user, "Email verified");
        record_auth_event("verify_email");

        Ok((record, Claim::new(user, true, true, now)))
    }

    pub async fn login(
        &self,
        project: Option<Uuid>,
        email: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<(AuthRecord, Claim)> {
        let email = normalize_email(email).map_err(|_| Error::InvalidCredentials)?;
        let store = self.store(project).await?;

        let Some(record) = store.find_where("email", &email).await? else {
            verify_dummy(password);
            return Err(Error::InvalidCredentials);
        };

        let temp_ttl = Duration::hours(self.config.temp_password_ttl_hours);
        let matches_password = verify_password(password, &record.password_hash);
        let matches_temp = !matches_password
            && record.has_temp_password()
            && Self::still_valid(record.password_temp_request_date.as_deref(), temp_ttl, now)
            && record
                .password_temp_hash
                .as_deref()
                .is_some_and(|hash| verify_password(password, hash));

        if !(matches_password || matches_temp) {
            tracing::debug!(user = %record.rid, "Login rejected");
            record_auth_event("login_failed");
            return Err(Error::InvalidCredentials);
        }

        let rid = Uuid::parse_str(&record.rid)
            .map_err(|e| Error::Internal(format!("stored rid is not a uuid: {e}")))?;
        tracing::info!(user = %rid, temporary = matches_temp, "Logged in");
        record_auth_event("login");

        let claim = Claim::new(rid, true, record.email_verified, now);
        Ok((record, claim))
    }

    /// Unknown addresses succeed silently with no code issued.
    pub async fn request_password_reset(
        &self,
        project: Option<Uuid>,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CodeIssued>> {
        let email = normalize_email(email)?;
        let store = self.store(project).await?;

        let Some(record) = store.find_where("email", &email).await? else {
            tracing::debug!("Password reset requested for unknown email");
            return Ok(None);
        };

        let code = reset_code();
        let ts = timestamp(now);
        let sql = format!(
            "UPDATE {} SET password_reset_code_hash = ?, password_reset_request_date = ?, \
             password_reset_failures = 0, updated_at = ? WHERE rid = ? RETURNING {}",
            store.table(),
            AuthRecord::COLUMNS
        );
        let record = sqlx::query_as::<_, AuthRecord>(&sql)
            .bind(hash_password(&code)?)
            .bind(&ts)
            .bind(&ts)
            .bind(&record.rid)
            .fetch_one(store.pool())
            .await?;

        let rid = Uuid::parse_str(&record.rid)
            .map_err(|e| Error::Internal(format!("stored rid is not a uuid: {e}")))?;
        tracing::info!(user = %rid, "Issued password reset code");

        Ok(Some(CodeIssued {
            claim: Claim::new(rid, false, record.email_verified, now),
            record,
            code,
        }))
    }

    pub async fn reset_password(
        &self,
        project: Option<Uuid>,
        user: Uuid,
        request: &ResetPasswordRequest,
        now: DateTime<Utc>,
    ) -> Result<AuthRecord> {
        validate_password_strength("new_password", &request.new_password)?;
        if request.new_password != request.new_password_confirmed {
            return Err(ValidationError::field("new_password_confirmed", "Passwords do not match").into());
        }

        let store = self.store(project).await?;
        let record = self.load(&store, user).await?;

        let ttl = Duration::minutes(self.config.reset_code_ttl_minutes);
        let Some(stored_hash) = record.password_reset_code_hash.as_deref() else {
            return Err(Error::InvalidCode);
        };
        if !Self::still_valid(record.password_reset_request_date.as_deref(), ttl, now)
            || !verify_password(request.verification_code.trim(), stored_hash)
        {
            self.record_reset_failure(&store, &record.rid, stored_hash, now)
                .await?;
            return Err(Error::InvalidCode);
        }

        // Resetting proves control of the mailbox, so it also completes
        // verification and retires any temporary password.
        let promote = !record.email_verified || record.has_temp_password();
        let sql = format!(
            "UPDATE {table} SET password_hash = ?1, password_reset_code_hash = NULL, \
             password_reset_request_date = NULL, password_reset_failures = 0, \
             email_verified = CASE WHEN ?2 THEN 1 ELSE email_verified END, \
             password_temp_hash = CASE WHEN ?2 THEN NULL ELSE password_temp_hash END, \
             password_temp_request_date = CASE WHEN ?2 THEN NULL ELSE password_temp_request_date END, \
             updated_at = ?3 \
             WHERE rid = ?4 AND password_reset_code_hash = ?5 RETURNING {columns}",
            table = store.table(),
            columns = AuthRecord::COLUMNS
        );
        let record = sqlx::query_as::<_, AuthRecord>(&sql)
            .bind(hash_password(&request.new_password)?)
            .bind(promote)
            .bind(timestamp(now))
            .bind(&record.rid)
            .bind(stored_hash)
            .fetch_optional(store.pool())
            .await?
            .ok_or(Error::InvalidCode)?;

        tracing::info!(user = %user, promoted = promote, "Password reset");
        record_auth_event("reset_password");
        Ok(record)
    }

    /// Count a wrong reset code; the code is revoked once the limit is hit.
    async fn record_reset_failure(
        &self,
        store: &Repository<AuthRecord>,
        rid: &str,
        stored_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET password_reset_failures = password_reset_failures + 1, \
             password_reset_code_hash = CASE WHEN password_reset_failures + 1 >= ?1 \
                 THEN NULL ELSE password_reset_code_hash END, \
             password_reset_request_date = CASE WHEN password_reset_failures + 1 >= ?1 \
                 THEN NULL ELSE password_reset_request_date END, \
             updated_at = ?2 \
             WHERE rid = ?3 AND password_reset_code_hash = ?4 \
             RETURNING password_reset_failures",
            store.table()
        );
        let failures: Option<(i64,)> = sqlx::query_as(&sql)
            .bind(self.config.max_reset_failures)
            .bind(timestamp(now))
            .bind(rid)
            .bind(stored_hash)
            .fetch_optional(store.pool())
            .await?;

        if let Some((failures,)) = failures {
            if failures >= self.config.max_reset_failures {
                tracing::warn!(user = %rid, failures, "Password reset code revoked after repeated failures");
                record_auth_event("reset_code_revoked");
            }
        }
        Ok(())
    }

    pub fn logout(&self, now: DateTime<Utc>) -> Claim {
        Claim::logged_out(now)
    }

    /// Create an account holding only a temporary password.
    pub async fn invite(
        &self,
        project: Option<Uuid>,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<(AuthRecord, String)> {
        let email = normalize_email(email)?;
        let store = self.store(project).await?;
        if store.find_where("email", &email).await?.is_some() {
            return Err(Error::DuplicateEmail);
        }

        let temporary = temporary_password();
        // The permanent password is unusable until the invitee resets it
        let unusable = hash_password(&Uuid::new_v4().to_string())?;
        let rid = Uuid::new_v4();
        let ts = timestamp(now);
        let sql = format!(
            "INSERT INTO {} (rid, email, email_verified, password_hash, password_temp_hash, \
             password_temp_request_date, created_at, updated_at) \
             VALUES (?, ?, 0, ?, ?, ?, ?, ?) RETURNING {}",
            store.table(),
            AuthRecord::COLUMNS
        );
        let record = sqlx::query_as::<_, AuthRecord>(&sql)
            .bind(rid.to_string())
            .bind(&email)
            .bind(unusable)
            .bind(hash_password(&temporary)?)
            .bind(&ts)
            .bind(&ts)
            .bind(&ts)
            .fetch_one(store.pool())
            .await
            .map_err(unique_to_duplicate)?;

        tracing::info!(user = %rid, "Invited account");
        Ok((record, temporary))
    }

    pub async fn account(&self, project: Option<Uuid>, user: Uuid) -> Result<AuthRecord> {
        let store = self.store(project).await?;
        self.load(&store, user).await
    }

    /// Removes the account together with its enrollment and attempts.
    pub async fn delete_account(&self, project: Option<Uuid>, user: Uuid) -> Result<()> {
        let store = self.store(project).await?;
        let rid = user.to_string();

        let mut tx = self.pool.begin().await?;
        if !store.delete_by_rid(&mut tx, &rid).await? {
            return Err(Error::NotFound(AuthRecord::NAME));
        }
        Repository::<Enrollment>::new(self.pool.clone())
            .delete_where(&mut tx, "user_rid", &rid)
            .await?;
        Repository::<IdentificationAttempt>::new(self.pool.clone())
            .delete_where(&mut tx, "user_rid", &rid)
            .await?;
        tx.commit().await?;

        tracing::info!(user = %user, "Deleted account");
        Ok(())
    }
}

fn unique_to_duplicate(err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => Error::DuplicateEmail,
        _ => Error::StorageUnavailable(err),
    }
}
