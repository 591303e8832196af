//! Enrollment rows holding the three reference recordings of an identity.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::Record;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Enrollment {
    #[serde(skip)]
    pub id: i64,
    pub rid: String,
    pub user_rid: String,
    #[serde(skip)]
    pub recording_1: Option<Vec<u8>>,
    #[serde(skip)]
    pub recording_2: Option<Vec<u8>>,
    #[serde(skip)]
    pub recording_3: Option<Vec<u8>>,
    #[serde(skip)]
    pub recording_1_normalised: Option<Vec<u8>>,
    #[serde(skip)]
    pub recording_2_normalised: Option<Vec<u8>>,
    #[serde(skip)]
    pub recording_3_normalised: Option<Vec<u8>>,
    pub recording_1_mfcc: Option<String>,
    pub recording_2_mfcc: Option<String>,
    pub recording_3_mfcc: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Record for Enrollment {
    const TABLE: &'static str = "enrollments";
    const NAME: &'static str = "enrollment";
    const COLUMNS: &'static str = "id, rid, user_rid, recording_1, recording_2, recording_3, \
        recording_1_normalised, recording_2_normalised, recording_3_normalised, \
        recording_1_mfcc, recording_2_mfcc, recording_3_mfcc, created_at, updated_at";
}

impl Enrollment {
    pub fn recording(&self, step: ReferenceStep) -> Option<&[u8]> {
        match step {
            ReferenceStep::One => self.recording_1.as_deref(),
            ReferenceStep::Two => self.recording_2.as_deref(),
            ReferenceStep::Three => self.recording_3.as_deref(),
        }
    }

    pub fn mfcc(&self, step: ReferenceStep) -> Option<Vec<f64>> {
        let raw = match step {
            ReferenceStep::One => self.recording_1_mfcc.as_deref(),
            ReferenceStep::Two => self.recording_2_mfcc.as_deref(),
            ReferenceStep::Three => self.recording_3_mfcc.as_deref(),
        };
        parse_vector(raw)
    }

    /// First step without a recording, `None` once all three are captured.
    pub fn next_step(&self) -> Option<ReferenceStep> {
        ReferenceStep::ALL
            .into_iter()
            .find(|step| self.recording(*step).is_none())
    }

    pub fn is_complete(&self) -> bool {
        self.next_step().is_none()
    }

    pub fn features_ready(&self) -> bool {
        ReferenceStep::ALL
            .into_iter()
            .all(|step| self.mfcc(step).is_some())
    }
}

/// One of the three fixed reference slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceStep {
    One,
    Two,
    Three,
}

impl ReferenceStep {
    pub const ALL: [ReferenceStep; 3] = [Self::One, Self::Two, Self::Three];

    pub fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
        }
    }

    pub(crate) fn recording_column(self) -> &'static str {
        match self {
            Self::One => "recording_1",
            Self::Two => "recording_2",
            Self::Three => "recording_3",
        }
    }

    pub(crate) fn normalised_column(self) -> &'static str {
        match self {
            Self::One => "recording_1_normalised",
            Self::Two => "recording_2_normalised",
            Self::Three => "recording_3_normalised",
        }
    }

    pub(crate) fn mfcc_column(self) -> &'static str {
        match self {
            Self::One => "recording_1_mfcc",
            Self::Two => "recording_2_mfcc",
            Self::Three => "recording_3_mfcc",
        }
    }
}

impl From<ReferenceStep> for u8 {
    fn from(step: ReferenceStep) -> Self {
        step.number()
    }
}

impl TryFrom<i64> for ReferenceStep {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            3 => Ok(Self::Three),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for ReferenceStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Helper to parse a JSON feature vector column
pub fn parse_vector(json: Option<&str>) -> Option<Vec<f64>> {
    json.and_then(|s| serde_json::from_str(s).ok())
}

/// Summary returned after each submission.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentResponse {
    pub rid: String,
    pub recorded_steps: Vec<u8>,
    pub next_step: Option<u8>,
    pub complete: bool,
    pub features_ready: bool,
    pub updated_at: String,
}

impl From<&Enrollment> for EnrollmentResponse {
    fn from(enrollment: &Enrollment) -> Self {
        Self {
            rid: enrollment.rid.clone(),
            recorded_steps: ReferenceStep::ALL
                .into_iter()
                .filter(|step| enrollment.recording(*step).is_some())
                .map(ReferenceStep::number)
                .collect(),
            next_step: enrollment.next_step().map(ReferenceStep::number),
            complete: enrollment.is_complete(),
            features_ready: enrollment.features_ready(),
            updated_at: enrollment.updated_at.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_conversion() {
        assert_eq!(ReferenceStep::try_from(1_i64), Ok(ReferenceStep::One));
        assert_eq!(ReferenceStep::try_from(3_i64), Ok(ReferenceStep::Three));
        assert_eq!(ReferenceStep::try_from(0_i64), Err(0));
        assert_eq!(ReferenceStep::try_from(4_i64), Err(4));
        assert_eq!(ReferenceStep::Two.recording_column(), "recording_2");
    }

    #[test]
    fn test_parse_vector() {
        assert_eq!(parse_vector(Some("[1.0, 2.5]")), Some(vec![1.0, 2.5]));
        assert_eq!(parse_vector(Some("not json")), None);
        assert_eq!(parse_vector(None), None);
    }
}
