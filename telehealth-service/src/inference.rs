use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::gemini;
use serde::Deserialize;
use tracing::debug;

/// Seam between the generator and the upstream inference provider.
/// Production uses Gemini; tests substitute a scripted client.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Names of the models the upstream currently serves for text
    /// generation.
    async fn list_models(&self) -> anyhow::Result<Vec<String>>;

    /// One completion call against a single model candidate. The response
    /// is raw text expected to contain a JSON object, possibly wrapped in
    /// code fences.
    async fn complete(&self, model: &str, prompt: &str) -> anyhow::Result<String>;
}

const CATALOG_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    models: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogEntry {
    name: String,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

/// Gemini-backed inference client: rig for completions, the Generative
/// Language REST API for the model catalog.
pub struct GeminiClient {
    api_key: String,
    http: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl InferenceClient for GeminiClient {
    async fn list_models(&self) -> anyhow::Result<Vec<String>> {
        let response = self
            .http
            .get(CATALOG_URL)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await?
            .error_for_status()?;

        let catalog: CatalogResponse = response.json().await?;
        let models: Vec<String> = catalog
            .models
            .into_iter()
            .filter(|m| {
                m.supported_generation_methods
                    .iter()
                    .any(|method| method == "generateContent")
            })
            .map(|m| m.name)
            .collect();

        debug!(count = models.len(), "Fetched model catalog");
        Ok(models)
    }

    async fn complete(&self, model: &str, prompt: &str) -> anyhow::Result<String> {
        let client = gemini::Client::new(&self.api_key);
        let agent = client
            .agent(model)
            .temperature(0.4)
            .max_tokens(4096)
            .additional_params(serde_json::json!({
                "generationConfig": {
                    "topP": 0.8,
                    "topK": 40,
                    "responseMimeType": "application/json",
                }
            }))
            .build();

        let response = agent
            .prompt(prompt)
            .await
            .map_err(|e| anyhow::anyhow!("inference call failed for {model}: {e}"))?;
        Ok(response)
    }
}
