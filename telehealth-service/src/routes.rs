use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use task_flow::{Dispatcher, TaskError, TaskState};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::QueueMode;
use crate::generator::DiagnosisGenerator;
use crate::jobs::predict_disease_message;
use crate::models::{Consultation, MedicineReminder};
use crate::store::{ConsultationStore, MedicineStore};

type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub consultations: Arc<dyn ConsultationStore>,
    pub medicines: Arc<dyn MedicineStore>,
    pub generator: Arc<DiagnosisGenerator>,
    pub queue_mode: QueueMode,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/predict", post(predict))
        .route("/result/{task_id}", get(get_result))
        .route("/history", get(get_history))
        .route("/medicines", get(list_medicines).post(create_medicine))
        .route("/medicines/{id}", delete(delete_medicine))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

fn default_user() -> String {
    "anonymous".to_string()
}

#[derive(Debug, Deserialize)]
pub struct SymptomInput {
    text: String,
    #[serde(default = "default_user")]
    user_id: String,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<String>,
    consultation_id: Uuid,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
}

/// Submit symptoms for diagnosis. In worker mode this enqueues a
/// `predict_disease` task and returns immediately; in the degraded inline
/// mode generation runs inside the request.
async fn predict(
    State(state): State<AppState>,
    Json(input): Json<SymptomInput>,
) -> Result<Json<PredictResponse>, ApiError> {
    if input.text.trim().is_empty() {
        return Err(bad_request_error("Symptom text is required"));
    }

    let consultation = Consultation::new(input.user_id.clone(), input.text.clone());
    let consultation_id = consultation.id;
    state.consultations.create(consultation).await.map_err(|e| {
        error!(error = %e, "Failed to create consultation");
        internal_error("Failed to create consultation", &e.to_string())
    })?;
    info!(consultation_id = %consultation_id, "Created consultation");

    if state.queue_mode == QueueMode::Inline {
        let outcome = state.generator.generate(&input.text).await;
        let payload = outcome.to_value();
        if let Err(e) = state
            .consultations
            .update_diagnosis(consultation_id, &payload.to_string())
            .await
        {
            error!(consultation_id = %consultation_id, error = %e, "Failed to persist inline diagnosis");
        }
        let status = if outcome.is_success() {
            "SUCCESS"
        } else {
            "FAILURE"
        };
        return Ok(Json(PredictResponse {
            task_id: None,
            consultation_id,
            status: status.to_string(),
            result: Some(payload),
        }));
    }

    let message = predict_disease_message(&input.text, consultation_id)
        .map_err(|e| internal_error("Failed to build task message", &e.to_string()))?;

    match state.dispatcher.submit(message).await {
        Ok(handle) => {
            info!(task_id = %handle.id, consultation_id = %consultation_id, "Diagnosis task enqueued");
            Ok(Json(PredictResponse {
                task_id: Some(handle.id),
                consultation_id,
                status: "Processing".to_string(),
                result: None,
            }))
        }
        Err(e) => {
            error!(consultation_id = %consultation_id, error = %e, "Failed to enqueue diagnosis task");
            let payload = json!({
                "status": "error",
                "error": format!("Failed to queue diagnosis task: {e}"),
            });
            if let Err(db_err) = state
                .consultations
                .update_diagnosis(consultation_id, &payload.to_string())
                .await
            {
                error!(consultation_id = %consultation_id, error = %db_err, "Failed to record enqueue failure");
            }
            Err(internal_error("Failed to queue diagnosis task", &e.to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResultQuery {
    consultation_id: Option<Uuid>,
    timeout: Option<u64>,
}

/// Poll a diagnosis task. Always answers with a 200 JSON body; transport
/// or backend trouble degrades to a status field rather than an HTTP error.
async fn get_result(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<ResultQuery>,
) -> Json<Value> {
    // Bounded wait; a client asking for more than the hard task budget
    // gains nothing by it.
    let timeout = Duration::from_secs(query.timeout.unwrap_or(60).min(300));
    info!(task_id = %task_id, timeout_secs = timeout.as_secs(), "Polling for task result");

    match state.dispatcher.poll(&task_id, timeout).await {
        Ok(poll) => match poll.state {
            TaskState::Succeeded => {
                let result = poll.result.unwrap_or(Value::Null);
                if let Some(consultation_id) = query.consultation_id {
                    // Best-effort re-write; the worker already persisted this.
                    if let Err(e) = state
                        .consultations
                        .update_diagnosis(consultation_id, &result.to_string())
                        .await
                    {
                        error!(consultation_id = %consultation_id, error = %e, "Failed to update consultation from poll");
                    }
                }
                Json(json!({
                    "task_id": task_id,
                    "status": "SUCCESS",
                    "result": result,
                    "consultation_id": query.consultation_id,
                }))
            }
            TaskState::Failed => Json(json!({
                "task_id": task_id,
                "status": "FAILURE",
                "result": Value::Null,
                "error": poll.error.unwrap_or_else(|| "Unknown error".to_string()),
                "consultation_id": query.consultation_id,
            })),
            TaskState::Queued => Json(json!({
                "task_id": task_id,
                "status": "PENDING",
                "result": Value::Null,
                "message": "Task is still processing. Please try again later.",
                "consultation_id": query.consultation_id,
            })),
            TaskState::Running => Json(json!({
                "task_id": task_id,
                "status": "STARTED",
                "result": Value::Null,
                "message": "Task is started. Please check again shortly.",
                "consultation_id": query.consultation_id,
            })),
            TaskState::Retrying => Json(json!({
                "task_id": task_id,
                "status": "RETRY",
                "result": Value::Null,
                "message": "Task is retrying. Please check again shortly.",
                "consultation_id": query.consultation_id,
            })),
        },
        Err(TaskError::TaskNotFound(_)) => {
            warn!(task_id = %task_id, "Unknown or expired task polled");
            Json(json!({
                "task_id": task_id,
                "status": "PENDING",
                "result": Value::Null,
                "message": "Task is unknown or its result has expired. Please try again later.",
                "consultation_id": query.consultation_id,
            }))
        }
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Result backend unreachable");
            Json(json!({
                "task_id": task_id,
                "status": "ERROR",
                "result": Value::Null,
                "error": format!("Cannot retrieve task result: {e}"),
                "consultation_id": query.consultation_id,
            }))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    #[serde(default = "default_user")]
    user_id: String,
}

async fn get_history(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<Consultation>>, ApiError> {
    state
        .consultations
        .list_for_user(&query.user_id)
        .await
        .map(Json)
        .map_err(|e| {
            error!(error = %e, "Failed to load consultation history");
            internal_error("Failed to load history", &e.to_string())
        })
}

#[derive(Debug, Deserialize)]
pub struct MedicineInput {
    #[serde(default = "default_user")]
    user_id: String,
    medicine_name: String,
    dosage: String,
    frequency: String,
    reminder_time: String,
}

async fn list_medicines(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<MedicineReminder>>, ApiError> {
    state
        .medicines
        .list_for_user(&query.user_id)
        .await
        .map(Json)
        .map_err(|e| {
            error!(error = %e, "Failed to load medicine reminders");
            internal_error("Failed to load medicine reminders", &e.to_string())
        })
}

async fn create_medicine(
    State(state): State<AppState>,
    Json(input): Json<MedicineInput>,
) -> Result<(StatusCode, Json<MedicineReminder>), ApiError> {
    if input.medicine_name.trim().is_empty() {
        return Err(bad_request_error("Medicine name is required"));
    }

    let reminder = MedicineReminder {
        id: Uuid::new_v4(),
        user_id: input.user_id,
        medicine_name: input.medicine_name,
        dosage: input.dosage,
        frequency: input.frequency,
        reminder_time: input.reminder_time,
        is_active: true,
        created_at: chrono::Utc::now(),
    };

    state
        .medicines
        .create(reminder.clone())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to create medicine reminder");
            internal_error("Failed to create medicine reminder", &e.to_string())
        })?;
    Ok((StatusCode::CREATED, Json(reminder)))
}

async fn delete_medicine(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let removed = state.medicines.delete(id).await.map_err(|e| {
        error!(reminder_id = %id, error = %e, "Failed to delete medicine reminder");
        internal_error("Failed to delete medicine reminder", &e.to_string())
    })?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Reminder not found", "id": id })),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::InferenceClient;
    use crate::store::{InMemoryConsultationStore, InMemoryMedicineStore};
    use async_trait::async_trait;

    struct OfflineClient;

    #[async_trait]
    impl InferenceClient for OfflineClient {
        async fn list_models(&self) -> anyhow::Result<Vec<String>> {
            anyhow::bail!("offline")
        }

        async fn complete(&self, _model: &str, _prompt: &str) -> anyhow::Result<String> {
            anyhow::bail!("offline")
        }
    }

    fn test_state() -> AppState {
        AppState {
            dispatcher: Dispatcher::builder().build(),
            consultations: Arc::new(InMemoryConsultationStore::new()),
            medicines: Arc::new(InMemoryMedicineStore::new()),
            generator: Arc::new(DiagnosisGenerator::new(
                Arc::new(OfflineClient),
                "gemini-1.5-flash",
            )),
            queue_mode: QueueMode::Worker,
        }
    }

    #[tokio::test]
    async fn creating_a_reminder_answers_created_with_the_full_record() {
        let state = test_state();
        let input = MedicineInput {
            user_id: "alice".to_string(),
            medicine_name: "Ibuprofen".to_string(),
            dosage: "200mg".to_string(),
            frequency: "twice a day".to_string(),
            reminder_time: "08:00".to_string(),
        };

        let (status, Json(reminder)) = create_medicine(State(state.clone()), Json(input))
            .await
            .unwrap();

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(reminder.frequency, "twice a day");
        assert!(reminder.is_active);

        let listed = state.medicines.list_for_user("alice").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, reminder.id);
    }

    #[tokio::test]
    async fn deleting_an_unknown_reminder_is_not_found() {
        let state = test_state();
        let err = delete_medicine(State(state), Path(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }
}
