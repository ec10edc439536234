mod catalog;
mod config;
mod generator;
mod inference;
mod jobs;
mod models;
mod routes;
mod store;

use std::sync::Arc;

use axum::http::{HeaderValue, Request};
use axum::middleware::{Next, from_fn};
use task_flow::{Dispatcher, DispatcherConfig};
use tracing::{Instrument, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::config::{AppConfig, QueueMode};
use crate::generator::DiagnosisGenerator;
use crate::inference::GeminiClient;
use crate::jobs::PredictDiseaseHandler;
use crate::routes::{AppState, build_router};
use crate::store::{
    ConsultationStore, InMemoryConsultationStore, InMemoryMedicineStore, MedicineStore,
    PostgresStore,
};

/// Initialize structured JSON tracing based on environment variables
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "telehealth_service=debug,task_flow=debug,tower_http=debug".into());

    match log_format.as_str() {
        "pretty" => {
            // Human-readable logging for development
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        _ => {
            // Structured JSON logging for production
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
    }
}

/// Middleware to add correlation ID to all requests
async fn correlation_id_middleware(
    mut request: Request<axum::body::Body>,
    next: Next,
) -> axum::response::Response {
    let correlation_id = Uuid::new_v4().to_string();

    request.headers_mut().insert(
        "x-correlation-id",
        HeaderValue::from_str(&correlation_id).unwrap(),
    );

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    next.run(request).instrument(span).await
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    // Pick PostgreSQL when DATABASE_URL is set, otherwise in-memory stores.
    let (consultations, medicines): (Arc<dyn ConsultationStore>, Arc<dyn MedicineStore>) =
        match &config.database_url {
            Some(database_url) => match PostgresStore::connect(database_url).await {
                Ok(store) => {
                    info!("Using PostgreSQL persistence");
                    let store = Arc::new(store);
                    (store.clone(), store)
                }
                Err(e) => {
                    error!(
                        error = %e,
                        "Failed to connect to PostgreSQL, falling back to in-memory stores"
                    );
                    (
                        Arc::new(InMemoryConsultationStore::new()),
                        Arc::new(InMemoryMedicineStore::new()),
                    )
                }
            },
            None => {
                info!("Using in-memory persistence (set DATABASE_URL to use PostgreSQL)");
                (
                    Arc::new(InMemoryConsultationStore::new()),
                    Arc::new(InMemoryMedicineStore::new()),
                )
            }
        };

    let inference = Arc::new(GeminiClient::new(config.gemini_api_key.clone()));
    let generator = Arc::new(DiagnosisGenerator::new(
        inference,
        config.preferred_model.clone(),
    ));

    let dispatcher: Dispatcher = Dispatcher::builder()
        .register(Arc::new(PredictDiseaseHandler::new(
            generator.clone(),
            consultations.clone(),
        )))
        .with_config(DispatcherConfig {
            workers: config.worker_count,
            ..DispatcherConfig::default()
        })
        .build();

    if config.queue_mode == QueueMode::Inline {
        info!("Running in degraded inline mode: diagnosis generation happens in-request");
    }

    let app_state = AppState {
        dispatcher,
        consultations,
        medicines,
        generator,
        queue_mode: config.queue_mode,
    };

    let app = build_router(app_state).layer(from_fn(correlation_id_middleware));

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.bind_addr, error = %e, "Failed to bind");
            std::process::exit(1);
        }
    };

    info!("Server running on http://{}", config.bind_addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
