use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::catalog::{resolve_trial_order, static_fallback};
use crate::inference::InferenceClient;
use crate::models::DiagnosisReport;

/// Outcome of one diagnosis request. `Success` carries the structured
/// payload with `"status": "success"` already injected; `Failure` carries a
/// human-readable error message. Both serialize into the consultation's
/// single opaque diagnosis field.
#[derive(Debug, Clone)]
pub enum DiagnosisOutcome {
    Success { payload: Value },
    Failure { message: String },
}

impl DiagnosisOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DiagnosisOutcome::Success { .. })
    }

    /// The value persisted to the consultation record and handed to
    /// pollers.
    pub fn to_value(&self) -> Value {
        match self {
            DiagnosisOutcome::Success { payload } => payload.clone(),
            DiagnosisOutcome::Failure { message } => serde_json::json!({
                "status": "error",
                "error": message,
            }),
        }
    }
}

const DIAGNOSIS_PROMPT_TEMPLATE: &str = r#"You are a medical AI assistant. Analyze the following symptoms and provide a diagnosis in structured JSON format.

Symptoms: {symptoms}

Output MUST be a valid JSON object with the following structure:
{
  "diagnosis": "Name of the most likely condition",
  "diagnosis_summary": "A brief 1-2 sentence summary of the diagnosis",
  "detailed_diagnosis": "A comprehensive explanation of the condition",
  "conditions": [
    {
      "name": "Condition Name",
      "confidence": 85,
      "severity": "high" | "medium" | "low",
      "reasoning": "Why this matches"
    }
  ],
  "recommended_tests": ["List of recommended medical tests"],
  "consult_doctor": "Type of specialist to consult (e.g. Cardiologist)",
  "precautions": ["List of immediate precautions"],
  "prevention": ["List of prevention tips"],
  "lifestyle_tips": ["List of lifestyle changes"],
  "tips": ["General health tips"]
}

Ensure the response is purely valid JSON without markdown formatting."#;

fn build_prompt(symptoms: &str) -> String {
    DIAGNOSIS_PROMPT_TEMPLATE.replace("{symptoms}", symptoms)
}

/// Models sometimes wrap the JSON object in fenced-code markers despite the
/// mime-type hint.
fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

/// Drives the model trial sequence against the inference API until one
/// candidate returns parseable structured output, or all are exhausted.
pub struct DiagnosisGenerator {
    client: Arc<dyn InferenceClient>,
    preferred_model: String,
}

impl DiagnosisGenerator {
    pub fn new(client: Arc<dyn InferenceClient>, preferred_model: impl Into<String>) -> Self {
        Self {
            client,
            preferred_model: preferred_model.into(),
        }
    }

    pub async fn generate(&self, symptoms: &str) -> DiagnosisOutcome {
        if symptoms.trim().is_empty() {
            return DiagnosisOutcome::Failure {
                message: "Invalid symptoms input: must be a non-empty string".to_string(),
            };
        }

        // Catalog is queried fresh per invocation; a failed query degrades
        // to the static fallback rather than aborting.
        let trial_order = match self.client.list_models().await {
            Ok(available) => resolve_trial_order(&self.preferred_model, &available),
            Err(e) => {
                warn!(error = %e, "Model catalog query failed, using static fallback");
                static_fallback(&self.preferred_model)
            }
        };
        info!(candidates = trial_order.len(), "Resolved model trial order");

        let prompt = build_prompt(symptoms);
        let mut last_error = String::from("no models available");

        for model in &trial_order {
            info!(model = %model, "Attempting diagnosis candidate");
            let raw = match self.client.complete(model, &prompt).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(model = %model, error = %e, "Candidate failed, trying next");
                    last_error = e.to_string();
                    continue;
                }
            };

            let text = strip_code_fences(&raw);
            match serde_json::from_str::<DiagnosisReport>(text) {
                Ok(report) => {
                    info!(model = %model, "Valid structured diagnosis received");
                    let mut payload =
                        serde_json::to_value(report).unwrap_or(Value::Null);
                    payload["status"] = Value::String("success".to_string());
                    return DiagnosisOutcome::Success { payload };
                }
                Err(e) => {
                    warn!(model = %model, error = %e, "Unparseable response, trying next");
                    last_error = format!("model {model} returned unparseable output: {e}");
                }
            }
        }

        DiagnosisOutcome::Failure {
            message: format!("All models failed. Last error: {last_error}"),
        }
    }
}
