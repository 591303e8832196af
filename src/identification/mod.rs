//! Identification attempt lifecycle.
//!
//! An attempt moves `Created -> Dispatched -> Resolved -> Consumed`. Every
//! transition is a single conditional `UPDATE`, so concurrent resolvers and
//! consumers race safely without application locks: at most one outcome is
//! ever recorded and a result is handed out at most once.

use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::metrics::record_attempt_stage;
use crate::db::{now_timestamp, DbPool, Enrollment, IdentificationAttempt, Record, Repository};
use crate::enrollment::validate_recording;
use crate::error::{Error, Result};
use crate::jobs::MatchingJobClient;

/// What the latest attempt of a user looks like right now.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// The user has never made an attempt.
    NotFound,
    /// Still waiting for the matching job.
    Pending,
    /// Resolved and not yet used.
    Ready(IdentificationAttempt),
    /// The latest attempt was already used; a new attempt is needed.
    AlreadyConsumed,
}

/// Outcome of the result endpoint's poll-then-consume step.
#[derive(Debug, Clone)]
pub enum IdentificationResult {
    Pending,
    Identified(IdentificationAttempt),
    Rejected(IdentificationAttempt),
}

#[derive(Clone)]
pub struct IdentificationCoordinator {
    store: Repository<IdentificationAttempt>,
    enrollments: Repository<Enrollment>,
    jobs: Arc<dyn MatchingJobClient>,
    /// Whether a deferred job can still report back through a callback.
    callbacks: bool,
}

impl IdentificationCoordinator {
    pub fn new(pool: DbPool, jobs: Arc<dyn MatchingJobClient>) -> Self {
        Self {
            store: Repository::new(pool.clone()),
            enrollments: Repository::new(pool),
            jobs,
            callbacks: true,
        }
    }

    /// Without callbacks a deferred job never resolves, so it counts as failed.
    pub fn with_callbacks(mut self, enabled: bool) -> Self {
        self.callbacks = enabled;
        self
    }

    /// Record a challenge recording. Returns before any matching happens.
    pub async fn create(&self, user: Uuid, bytes: &[u8]) -> Result<IdentificationAttempt> {
        validate_recording(bytes)?;

        let enrolled = self
            .enrollments
            .find_where("user_rid", &user.to_string())
            .await?
            .is_some_and(|e| e.is_complete());
        if !enrolled {
            return Err(Error::validation(
                "recording",
                "All three reference recordings are required before identification",
            ));
        }

        let ts = now_timestamp();
        let sql = format!(
            "INSERT INTO {} (rid, user_rid, recording, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) RETURNING {}",
            IdentificationAttempt::TABLE,
            IdentificationAttempt::COLUMNS
        );
        let attempt = sqlx::query_as::<_, IdentificationAttempt>(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(user.to_string())
            .bind(bytes)
            .bind(&ts)
            .bind(&ts)
            .fetch_one(self.store.pool())
            .await?;

        tracing::info!(user = %user, attempt = %attempt.rid, size = bytes.len(), "Created identification attempt");
        record_attempt_stage("created");
        Ok(attempt)
    }

    /// Mark the attempt dispatched and request matching in the background.
    ///
    /// Only the caller that flips `dispatched_at` from NULL spawns the job, so
    /// resolved or already dispatched attempts yield `None`. A job failure
    /// clears the mark so the next poll dispatches again. An inline outcome
    /// from the job service is resolved immediately.
    pub async fn dispatch(&self, attempt: &IdentificationAttempt) -> Result<Option<JoinHandle<()>>> {
        let user = Uuid::parse_str(&attempt.user_rid)
            .map_err(|e| Error::Internal(format!("stored user_rid is not a uuid: {e}")))?;
        let ts = now_timestamp();
        let claimed = sqlx::query(&format!(
            "UPDATE {} SET dispatched_at = ?, updated_at = ? \
             WHERE rid = ? AND identified IS NULL AND dispatched_at IS NULL",
            IdentificationAttempt::TABLE
        ))
        .bind(&ts)
        .bind(&ts)
        .bind(&attempt.rid)
        .execute(self.store.pool())
        .await?
        .rows_affected();

        if claimed != 1 {
            tracing::debug!(attempt = %attempt.rid, "Attempt already dispatched or resolved");
            return Ok(None);
        }
        record_attempt_stage("dispatched");

        let coordinator = self.clone();
        let rid = attempt.rid.clone();
        Ok(Some(tokio::spawn(async move {
            coordinator.run_job(user, rid).await;
        })))
    }

    async fn run_job(&self, user: Uuid, rid: String) {
        let failure = match self.jobs.request_identification(user).await {
            Ok(Some(outcome)) => {
                if let Err(e) = self
                    .resolve(&rid, outcome.identified, outcome.feature_vector)
                    .await
                {
                    tracing::warn!(attempt = %rid, error = %e, "Failed to record matching outcome");
                }
                return;
            }
            Ok(None) if self.callbacks => {
                tracing::debug!(attempt = %rid, "Matching job accepted, awaiting callback");
                return;
            }
            Ok(None) => Error::JobUnavailable("no outcome and callbacks are disabled".to_string()),
            Err(e) => e,
        };

        tracing::warn!(attempt = %rid, error = %failure, "Matching job unavailable");
        record_attempt_stage("dispatch_failed");
        if let Err(e) = self.clear_dispatch(&rid).await {
            tracing::error!(attempt = %rid, error = %e, "Failed to clear dispatch mark");
        }
    }

    async fn clear_dispatch(&self, rid: &str) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET dispatched_at = NULL WHERE rid = ? AND identified IS NULL",
            IdentificationAttempt::TABLE
        ))
        .bind(rid)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Record the matching outcome. Repeating the same outcome is a no-op; a
    /// different outcome for an already resolved attempt is rejected.
    pub async fn resolve(
        &self,
        rid: &str,
        identified: bool,
        features: Option<Vec<f64>>,
    ) -> Result<IdentificationAttempt> {
        let features = features.map(|f| serde_json::to_string(&f)).transpose()?;
        let ts = now_timestamp();
        let sql = format!(
            "UPDATE {} SET identified = ?, feature_vector = COALESCE(?, feature_vector), \
             resolved_at = ?, updated_at = ? WHERE rid = ? AND identified IS NULL RETURNING {}",
            IdentificationAttempt::TABLE,
            IdentificationAttempt::COLUMNS
        );
        let updated = sqlx::query_as::<_, IdentificationAttempt>(&sql)
            .bind(identified)
            .bind(features)
            .bind(&ts)
            .bind(&ts)
            .bind(rid)
            .fetch_optional(self.store.pool())
            .await?;

        if let Some(attempt) = updated {
            tracing::info!(attempt = %rid, identified, "Resolved identification attempt");
            let outcome = if identified { "identified" } else { "rejected" };
            record_attempt_stage(outcome);
            return Ok(attempt);
        }

        let existing = self
            .store
            .find_by_rid(rid)
            .await?
            .ok_or(Error::NotFound(IdentificationAttempt::NAME))?;
        if existing.identified == Some(identified) {
            Ok(existing)
        } else {
            tracing::warn!(attempt = %rid, identified, stored = ?existing.identified, "Conflicting matching outcome ignored");
            Err(Error::AlreadyResolved)
        }
    }

    /// Inspect only the most recent attempt of `user`.
    pub async fn poll_latest_for_user(&self, user: Uuid) -> Result<PollOutcome> {
        let user_rid = user.to_string();
        let latest = self
            .store
            .list_before(Some(("user_rid", &user_rid)), None, 1)
            .await?
            .into_iter()
            .next();

        let Some(attempt) = latest else {
            return Ok(PollOutcome::NotFound);
        };

        if attempt.identified.is_none() {
            if attempt.dispatched_at.is_none() {
                tracing::info!(attempt = %attempt.rid, "Re-dispatching undispatched attempt");
                self.dispatch(&attempt).await?;
            }
            return Ok(PollOutcome::Pending);
        }

        if attempt.used_for_result {
            Ok(PollOutcome::AlreadyConsumed)
        } else {
            Ok(PollOutcome::Ready(attempt))
        }
    }

    /// Hand out a resolved result exactly once.
    pub async fn consume(&self, rid: &str) -> Result<IdentificationAttempt> {
        let sql = format!(
            "UPDATE {} SET used_for_result = 1, updated_at = ? \
             WHERE rid = ? AND used_for_result = 0 AND identified IS NOT NULL RETURNING {}",
            IdentificationAttempt::TABLE,
            IdentificationAttempt::COLUMNS
        );
        let consumed = sqlx::query_as::<_, IdentificationAttempt>(&sql)
            .bind(now_timestamp())
            .bind(rid)
            .fetch_optional(self.store.pool())
            .await?;

        if let Some(attempt) = consumed {
            record_attempt_stage("consumed");
            return Ok(attempt);
        }

        let existing = self
            .store
            .find_by_rid(rid)
            .await?
            .ok_or(Error::NotFound(IdentificationAttempt::NAME))?;
        if existing.used_for_result {
            Err(Error::AlreadyConsumed)
        } else {
            Err(Error::validation("attempt", "Identification attempt is not resolved yet"))
        }
    }

    /// Poll and, if a result is ready, consume it.
    pub async fn result(&self, user: Uuid) -> Result<IdentificationResult> {
        match self.poll_latest_for_user(user).await? {
            PollOutcome::NotFound => Err(Error::NotFound(IdentificationAttempt::NAME)),
            PollOutcome::Pending => Ok(IdentificationResult::Pending),
            PollOutcome::AlreadyConsumed => Err(Error::AlreadyConsumed),
            PollOutcome::Ready(attempt) => {
                let attempt = self.consume(&attempt.rid).await?;
                if attempt.identified == Some(true) {
                    tracing::info!(user = %user, attempt = %attempt.rid, "User identified");
                    Ok(IdentificationResult::Identified(attempt))
                } else {
                    tracing::info!(user = %user, attempt = %attempt.rid, "User not identified");
                    Ok(IdentificationResult::Rejected(attempt))
                }
            }
        }
    }

    /// Attempts of `user`, newest first, strictly older than `cursor`.
    pub async fn history(
        &self,
        user: Uuid,
        cursor: Option<&str>,
        limit: i64,
    ) -> Result<Vec<IdentificationAttempt>> {
        let user_rid = user.to_string();
        Ok(self
            .store
            .list_before(Some(("user_rid", &user_rid)), cursor, limit.clamp(1, 100))
            .await?)
    }

    pub async fn find(&self, rid: &str) -> Result<IdentificationAttempt> {
        self.store
            .find_by_rid(rid)
            .await?
            .ok_or(Error::NotFound(IdentificationAttempt::NAME))
    }
}
