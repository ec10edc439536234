use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{Consultation, MedicineReminder};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence seam for consultation records.
///
/// `update_diagnosis` on an unknown consultation logs and returns Ok: the
/// record may have been removed or the identifier may be stale, which is
/// not fatal to the task that produced the outcome.
#[async_trait]
pub trait ConsultationStore: Send + Sync {
    async fn create(&self, consultation: Consultation) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Consultation>>;
    async fn update_diagnosis(&self, id: Uuid, diagnosis: &str) -> Result<()>;
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Consultation>>;
}

/// Persistence seam for medicine reminders.
#[async_trait]
pub trait MedicineStore: Send + Sync {
    async fn create(&self, reminder: MedicineReminder) -> Result<()>;
    async fn delete(&self, id: Uuid) -> Result<bool>;
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<MedicineReminder>>;
}

/// In-memory implementation of `ConsultationStore`.
pub struct InMemoryConsultationStore {
    consultations: DashMap<Uuid, Consultation>,
}

impl InMemoryConsultationStore {
    pub fn new() -> Self {
        Self {
            consultations: DashMap::new(),
        }
    }
}

impl Default for InMemoryConsultationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConsultationStore for InMemoryConsultationStore {
    async fn create(&self, consultation: Consultation) -> Result<()> {
        self.consultations.insert(consultation.id, consultation);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Consultation>> {
        Ok(self.consultations.get(&id).map(|entry| entry.clone()))
    }

    async fn update_diagnosis(&self, id: Uuid, diagnosis: &str) -> Result<()> {
        match self.consultations.get_mut(&id) {
            Some(mut entry) => {
                entry.diagnosis = diagnosis.to_string();
                Ok(())
            }
            None => {
                warn!(consultation_id = %id, "Consultation not found, skipping diagnosis update");
                Ok(())
            }
        }
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Consultation>> {
        let mut consultations: Vec<Consultation> = self
            .consultations
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.clone())
            .collect();
        consultations.sort_by_key(|c| c.created_at);
        Ok(consultations)
    }
}

/// In-memory implementation of `MedicineStore`.
pub struct InMemoryMedicineStore {
    reminders: DashMap<Uuid, MedicineReminder>,
}

impl InMemoryMedicineStore {
    pub fn new() -> Self {
        Self {
            reminders: DashMap::new(),
        }
    }
}

impl Default for InMemoryMedicineStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MedicineStore for InMemoryMedicineStore {
    async fn create(&self, reminder: MedicineReminder) -> Result<()> {
        self.reminders.insert(reminder.id, reminder);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.reminders.remove(&id).is_some())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<MedicineReminder>> {
        let mut reminders: Vec<MedicineReminder> = self
            .reminders
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.clone())
            .collect();
        reminders.sort_by_key(|r| r.created_at);
        Ok(reminders)
    }
}

/// PostgreSQL-backed stores. Tables are created on connect so a fresh
/// database works without a separate migration step.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS consultations (
                id UUID PRIMARY KEY,
                user_id TEXT NOT NULL,
                symptoms TEXT NOT NULL,
                diagnosis TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS medicine_reminders (
                id UUID PRIMARY KEY,
                user_id TEXT NOT NULL,
                medicine_name TEXT NOT NULL,
                dosage TEXT NOT NULL,
                frequency TEXT NOT NULL,
                reminder_time TEXT NOT NULL,
                is_active BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        info!("Connected to PostgreSQL and ensured tables exist");
        Ok(Self { pool })
    }
}

#[async_trait]
impl ConsultationStore for PostgresStore {
    async fn create(&self, consultation: Consultation) -> Result<()> {
        sqlx::query(
            "INSERT INTO consultations (id, user_id, symptoms, diagnosis, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(consultation.id)
        .bind(&consultation.user_id)
        .bind(&consultation.symptoms)
        .bind(&consultation.diagnosis)
        .bind(consultation.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Consultation>> {
        let consultation = sqlx::query_as::<_, Consultation>(
            "SELECT id, user_id, symptoms, diagnosis, created_at \
             FROM consultations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(consultation)
    }

    async fn update_diagnosis(&self, id: Uuid, diagnosis: &str) -> Result<()> {
        let result = sqlx::query("UPDATE consultations SET diagnosis = $1 WHERE id = $2")
            .bind(diagnosis)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!(consultation_id = %id, "Consultation not found, skipping diagnosis update");
        }
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Consultation>> {
        let consultations = sqlx::query_as::<_, Consultation>(
            "SELECT id, user_id, symptoms, diagnosis, created_at \
             FROM consultations WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(consultations)
    }
}

#[async_trait]
impl MedicineStore for PostgresStore {
    async fn create(&self, reminder: MedicineReminder) -> Result<()> {
        sqlx::query(
            "INSERT INTO medicine_reminders \
             (id, user_id, medicine_name, dosage, frequency, reminder_time, is_active, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(reminder.id)
        .bind(&reminder.user_id)
        .bind(&reminder.medicine_name)
        .bind(&reminder.dosage)
        .bind(&reminder.frequency)
        .bind(&reminder.reminder_time)
        .bind(reminder.is_active)
        .bind(reminder.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM medicine_reminders WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<MedicineReminder>> {
        let reminders = sqlx::query_as::<_, MedicineReminder>(
            "SELECT id, user_id, medicine_name, dosage, frequency, reminder_time, is_active, created_at \
             FROM medicine_reminders WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(reminders)
    }
}
