//! Capture of the three reference recordings that make up an enrollment.

use std::sync::Arc;

use uuid::Uuid;

use crate::api::metrics::record_reference_recording;
use crate::db::{now_timestamp, DbPool, Enrollment, Record, ReferenceStep, Repository};
use crate::error::{Error, Result, ValidationError};
use crate::jobs::MatchingJobClient;

/// Upper bound for any uploaded recording.
pub const MAX_RECORDING_BYTES: usize = 5 * 1024 * 1024;

/// Reject empty and oversized recordings before touching storage.
pub fn validate_recording(bytes: &[u8]) -> std::result::Result<(), ValidationError> {
    if bytes.is_empty() {
        return Err(ValidationError::EmptyPayload);
    }
    if bytes.len() > MAX_RECORDING_BYTES {
        return Err(ValidationError::PayloadTooLarge {
            size: bytes.len(),
            limit: MAX_RECORDING_BYTES,
        });
    }
    Ok(())
}

pub struct EnrollmentCoordinator {
    store: Repository<Enrollment>,
    jobs: Arc<dyn MatchingJobClient>,
}

impl EnrollmentCoordinator {
    pub fn new(pool: DbPool, jobs: Arc<dyn MatchingJobClient>) -> Self {
        Self {
            store: Repository::new(pool),
            jobs,
        }
    }

    /// Store `bytes` as reference recording `step` for `user`.
    ///
    /// The row is created by the first submission. Once all three slots are
    /// filled, feature processing is requested in the background.
    pub async fn submit_reference_recording(
        &self,
        user: Uuid,
        step: i64,
        bytes: &[u8],
    ) -> Result<Enrollment> {
        let step = ReferenceStep::try_from(step).map_err(ValidationError::InvalidStep)?;
        validate_recording(bytes)?;

        let column = step.recording_column();
        let ts = now_timestamp();
        // One statement so concurrent first submissions converge on a single row
        let sql = format!(
            "INSERT INTO {table} (rid, user_rid, {column}, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(user_rid) DO UPDATE SET \
             {column} = excluded.{column}, updated_at = excluded.updated_at \
             RETURNING {columns}",
            table = Enrollment::TABLE,
            columns = Enrollment::COLUMNS
        );
        let enrollment = sqlx::query_as::<_, Enrollment>(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(user.to_string())
            .bind(bytes)
            .bind(&ts)
            .bind(&ts)
            .fetch_one(self.store.pool())
            .await?;

        tracing::info!(
            user = %user,
            step = step.number(),
            size = bytes.len(),
            "Stored reference recording"
        );
        record_reference_recording(step.number());

        if enrollment.is_complete() {
            self.spawn_processing(user);
        }

        Ok(enrollment)
    }

    fn spawn_processing(&self, user: Uuid) {
        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(async move {
            match jobs.process_reference_recordings(user).await {
                Ok(()) => tracing::info!(user = %user, "Requested reference recording processing"),
                Err(e) => tracing::warn!(
                    user = %user,
                    error = %e,
                    "Failed to request reference recording processing"
                ),
            }
        });
    }

    /// Write back the derived features for one step. Raw recordings are left alone.
    pub async fn backfill_features(
        &self,
        user: Uuid,
        step: i64,
        normalised: Option<Vec<u8>>,
        mfcc: &[f64],
    ) -> Result<Enrollment> {
        let step = ReferenceStep::try_from(step).map_err(ValidationError::InvalidStep)?;
        if mfcc.is_empty() {
            return Err(Error::validation("mfcc", "Feature vector must not be empty"));
        }

        let sql = format!(
            "UPDATE {table} SET {normalised} = COALESCE(?, {normalised}), {mfcc} = ?, updated_at = ? \
             WHERE user_rid = ? RETURNING {columns}",
            table = Enrollment::TABLE,
            normalised = step.normalised_column(),
            mfcc = step.mfcc_column(),
            columns = Enrollment::COLUMNS
        );
        let enrollment = sqlx::query_as::<_, Enrollment>(&sql)
            .bind(normalised)
            .bind(serde_json::to_string(mfcc)?)
            .bind(now_timestamp())
            .bind(user.to_string())
            .fetch_optional(self.store.pool())
            .await?
            .ok_or(Error::NotFound(Enrollment::NAME))?;

        tracing::info!(user = %user, step = step.number(), "Stored reference features");
        Ok(enrollment)
    }

    pub async fn enrollment(&self, user: Uuid) -> Result<Option<Enrollment>> {
        Ok(self
            .store
            .find_where("user_rid", &user.to_string())
            .await?)
    }

    /// Step the user should record next, `None` once enrollment is complete.
    pub async fn next_step(&self, user: Uuid) -> Result<Option<ReferenceStep>> {
        Ok(match self.enrollment(user).await? {
            Some(enrollment) => enrollment.next_step(),
            None => Some(ReferenceStep::One),
        })
    }
}
