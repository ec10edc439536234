use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sentinel value stored in the diagnosis column until the background task
/// writes a terminal outcome.
pub const DIAGNOSIS_PENDING: &str = "Pending";

/// One symptom submission and its eventual diagnosis outcome. The diagnosis
/// column is an opaque text blob: the `"Pending"` sentinel, then either a
/// JSON success payload or a JSON error descriptor, written exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Consultation {
    pub id: Uuid,
    pub user_id: String,
    pub symptoms: String,
    pub diagnosis: String,
    pub created_at: DateTime<Utc>,
}

impl Consultation {
    pub fn new(user_id: impl Into<String>, symptoms: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            symptoms: symptoms.into(),
            diagnosis: DIAGNOSIS_PENDING.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// A scheduled medicine reminder for one user.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MedicineReminder {
    pub id: Uuid,
    pub user_id: String,
    pub medicine_name: String,
    pub dosage: String,
    /// Free-form cadence, e.g. "daily" or "twice a day".
    pub frequency: String,
    /// Time of day in "HH:MM" form, as entered by the user.
    pub reminder_time: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// The structured diagnosis the upstream model must return. Parsing into
/// this type is the schema validation step: a response missing any required
/// key is treated as a failed candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisReport {
    pub diagnosis: String,
    pub diagnosis_summary: String,
    pub detailed_diagnosis: String,
    pub conditions: Vec<ConditionAssessment>,
    pub recommended_tests: Vec<String>,
    pub consult_doctor: String,
    pub precautions: Vec<String>,
    pub prevention: Vec<String>,
    pub lifestyle_tips: Vec<String>,
    pub tips: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionAssessment {
    pub name: String,
    pub confidence: u32,
    pub severity: String,
    pub reasoning: String,
}
