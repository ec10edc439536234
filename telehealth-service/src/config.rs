use anyhow::Context;

/// How diagnosis generation is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Generation runs on the background worker pool (primary design).
    Worker,
    /// Degraded fallback: generation runs inline in the request handler.
    Inline,
}

/// Service configuration, read once at startup and passed into
/// constructors. Nothing else in the service reads the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub gemini_api_key: String,
    pub preferred_model: String,
    pub database_url: Option<String>,
    pub bind_addr: String,
    pub queue_mode: QueueMode,
    pub worker_count: usize,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let gemini_api_key = std::env::var("GEMINI_API_KEY")
            .context("GEMINI_API_KEY not set")?
            .trim()
            .to_string();
        if gemini_api_key.is_empty() {
            anyhow::bail!("GEMINI_API_KEY is empty");
        }

        let preferred_model = std::env::var("GEMINI_MODEL")
            .unwrap_or_else(|_| "gemini-1.5-flash".to_string())
            .trim()
            .to_string();

        let queue_mode = match std::env::var("QUEUE_MODE").as_deref() {
            Ok("inline") => QueueMode::Inline,
            _ => QueueMode::Worker,
        };

        let worker_count = std::env::var("WORKER_COUNT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(4);

        Ok(Self {
            gemini_api_key,
            preferred_model,
            database_url: std::env::var("DATABASE_URL").ok(),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            queue_mode,
            worker_count,
        })
    }
}
