//! Identification attempt models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::{parse_vector, Record};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IdentificationAttempt {
    #[serde(skip)]
    pub id: i64,
    pub rid: String,
    pub user_rid: String,
    #[serde(skip)]
    pub recording: Vec<u8>,
    pub feature_vector: Option<String>,
    /// `None` until the matching job reports an outcome
    pub identified: Option<bool>,
    pub used_for_result: bool,
    pub dispatched_at: Option<String>,
    pub resolved_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Record for IdentificationAttempt {
    const TABLE: &'static str = "identification_attempts";
    const NAME: &'static str = "identification attempt";
    const COLUMNS: &'static str = "id, rid, user_rid, recording, feature_vector, identified, \
        used_for_result, dispatched_at, resolved_at, created_at, updated_at";
}

impl IdentificationAttempt {
    pub fn state(&self) -> AttemptState {
        match (self.identified, self.used_for_result) {
            (Some(identified), true) => AttemptState::Consumed { identified },
            (Some(identified), false) => AttemptState::Resolved { identified },
            (None, _) if self.dispatched_at.is_some() => AttemptState::Dispatched,
            (None, _) => AttemptState::Created,
        }
    }

    pub fn features(&self) -> Option<Vec<f64>> {
        parse_vector(self.feature_vector.as_deref())
    }
}

/// Lifecycle of an attempt: `Created -> Dispatched -> Resolved -> Consumed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AttemptState {
    Created,
    Dispatched,
    Resolved { identified: bool },
    Consumed { identified: bool },
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptResponse {
    pub rid: String,
    #[serde(flatten)]
    pub state: AttemptState,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&IdentificationAttempt> for AttemptResponse {
    fn from(attempt: &IdentificationAttempt) -> Self {
        Self {
            rid: attempt.rid.clone(),
            state: attempt.state(),
            created_at: attempt.created_at.clone(),
            updated_at: attempt.updated_at.clone(),
        }
    }
}

/// Page of attempts, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptListResponse {
    pub items: Vec<AttemptResponse>,
    /// Pass back as `cursor` to fetch the next (older) page
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AttemptListQuery {
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt() -> IdentificationAttempt {
        IdentificationAttempt {
            id: 1,
            rid: "r".into(),
            user_rid: "u".into(),
            recording: vec![1, 2, 3],
            feature_vector: None,
            identified: None,
            used_for_result: false,
            dispatched_at: None,
            resolved_at: None,
            created_at: "2026-01-01T00:00:00.000000Z".into(),
            updated_at: "2026-01-01T00:00:00.000000Z".into(),
        }
    }

    #[test]
    fn test_state_progression() {
        let mut a = attempt();
        assert_eq!(a.state(), AttemptState::Created);

        a.dispatched_at = Some("2026-01-01T00:00:01.000000Z".into());
        assert_eq!(a.state(), AttemptState::Dispatched);

        a.identified = Some(false);
        assert_eq!(a.state(), AttemptState::Resolved { identified: false });

        a.used_for_result = true;
        assert_eq!(a.state(), AttemptState::Consumed { identified: false });
    }

    #[test]
    fn test_response_hides_recording() {
        let json = serde_json::to_value(AttemptResponse::from(&attempt())).unwrap();
        assert_eq!(json["state"], "created");
        assert!(json.get("recording").is_none());
    }
}
