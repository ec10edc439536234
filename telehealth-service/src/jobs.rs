use std::sync::Arc;

use async_trait::async_trait;
use task_flow::{JobContext, JobHandler, JobOutcome, TaskMessage};
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::generator::{DiagnosisGenerator, DiagnosisOutcome};
use crate::store::ConsultationStore;

pub const PREDICT_DISEASE_TASK: &str = "predict_disease";

/// Background job for one diagnosis request.
///
/// Message shape: `{task_name: "predict_disease", args: [symptoms],
/// kwargs: {consultation_id}}`. A validation failure is terminal on the
/// first attempt; a model-exhaustion failure asks for a retry until the
/// cap, writing the error payload to the consultation only once no
/// attempts remain.
pub struct PredictDiseaseHandler {
    generator: Arc<DiagnosisGenerator>,
    consultations: Arc<dyn ConsultationStore>,
}

impl PredictDiseaseHandler {
    pub fn new(
        generator: Arc<DiagnosisGenerator>,
        consultations: Arc<dyn ConsultationStore>,
    ) -> Self {
        Self {
            generator,
            consultations,
        }
    }

    /// Best effort: a persistence failure is logged but never changes the
    /// task's own terminal outcome.
    async fn write_back(&self, consultation_id: Option<Uuid>, diagnosis: &serde_json::Value) {
        let Some(id) = consultation_id else { return };
        let serialized = diagnosis.to_string();
        if let Err(e) = self.consultations.update_diagnosis(id, &serialized).await {
            error!(consultation_id = %id, error = %e, "Failed to persist diagnosis outcome");
        } else {
            info!(consultation_id = %id, "Consultation updated with diagnosis outcome");
        }
    }
}

#[async_trait]
impl JobHandler for PredictDiseaseHandler {
    fn name(&self) -> &str {
        PREDICT_DISEASE_TASK
    }

    async fn execute(
        &self,
        message: TaskMessage,
        ctx: JobContext,
    ) -> task_flow::Result<JobOutcome> {
        let consultation_id = message
            .kwargs
            .get("consultation_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());

        info!(
            task_id = %ctx.task_id,
            attempt = ctx.attempt,
            consultation_id = ?consultation_id,
            "Task started: predict_disease"
        );

        let Some(symptoms) = message.args.first().and_then(|v| v.as_str()) else {
            // Bad input is not retried: record the error and finish.
            let payload = serde_json::json!({
                "status": "error",
                "error": "Invalid symptoms input: must be a non-empty string",
            });
            self.write_back(consultation_id, &payload).await;
            return Ok(JobOutcome::Done(payload));
        };

        // Honor the soft budget so the task winds down before the
        // executor's hard cutoff.
        let outcome = match timeout(ctx.soft_time_limit, self.generator.generate(symptoms)).await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                let error = format!(
                    "soft time limit of {}s exceeded",
                    ctx.soft_time_limit.as_secs()
                );
                if !ctx.retries_remaining() {
                    let payload = serde_json::json!({ "status": "error", "error": error });
                    self.write_back(consultation_id, &payload).await;
                }
                return Ok(JobOutcome::Retry { error, delay: None });
            }
        };

        match outcome {
            DiagnosisOutcome::Success { .. } => {
                let payload = outcome.to_value();
                self.write_back(consultation_id, &payload).await;
                Ok(JobOutcome::Done(payload))
            }
            DiagnosisOutcome::Failure { ref message } if message.starts_with("All models failed") => {
                // Exhaustion is retried at the task level; the error payload
                // lands in the consultation only on the final attempt.
                warn!(task_id = %ctx.task_id, error = %message, "All model candidates failed");
                if !ctx.retries_remaining() {
                    self.write_back(consultation_id, &outcome.to_value()).await;
                }
                Ok(JobOutcome::Retry {
                    error: message.clone(),
                    delay: None,
                })
            }
            DiagnosisOutcome::Failure { .. } => {
                // Validation-style failure: terminal, no retry.
                let payload = outcome.to_value();
                self.write_back(consultation_id, &payload).await;
                Ok(JobOutcome::Done(payload))
            }
        }
    }
}

/// Convenience constructor for the queue message of one diagnosis request.
pub fn predict_disease_message(
    symptoms: &str,
    consultation_id: Uuid,
) -> task_flow::Result<TaskMessage> {
    TaskMessage::new(PREDICT_DISEASE_TASK)
        .arg(symptoms)?
        .kwarg("consultation_id", consultation_id.to_string())
}
