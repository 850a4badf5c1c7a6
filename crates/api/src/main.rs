mod config;
mod metrics;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use config::{AppConfig, OperationMode};
use gateway::{Gateway, ModelProvider, OllamaProvider};
use ingest::{Document, FileReader, HashingEmbedder};
use metrics::{Metrics, MetricsSnapshot, TimedOperation};
use query::{AgenticRag, PipelineError, RagOptions, RagRequest, RagResponse};

struct AppState {
    rag: AgenticRag,
    metrics: Arc<Metrics>,
    mode: OperationMode,
}

#[derive(Serialize)]
struct ProviderStatus {
    name: String,
    available: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    mode: OperationMode,
    primary: ProviderStatus,
    fallback: Option<ProviderStatus>,
}

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    /// Inline document text
    text: Option<String>,
    /// Or a `.txt`/`.md` file readable by the server
    path: Option<String>,
    #[serde(default)]
    options: RagOptions,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let (status, code) = match &err {
            PipelineError::Configuration(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            PipelineError::Chunking(_) => (StatusCode::UNPROCESSABLE_ENTITY, "empty_document"),
            PipelineError::Scoring(_) | PipelineError::Synthesis(_) => {
                (StatusCode::BAD_GATEWAY, "model_error")
            }
            PipelineError::Template(_) | PipelineError::Task(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load()?;

    let primary = OllamaProvider::new(config.primary.clone())?;
    if !primary.check_health().await {
        tracing::warn!(provider = primary.name(), "Primary provider is not reachable yet");
    }
    let mut gateway = Gateway::new(Arc::new(primary), &config.gateway);
    if let Some(settings) = &config.fallback {
        gateway = gateway.with_fallback(Arc::new(OllamaProvider::new(settings.clone())?));
    }

    let rag = AgenticRag::new(config.pipeline.clone(), Arc::new(gateway))?
        .with_embedder(Arc::new(HashingEmbedder::default()));

    let state = Arc::new(AppState {
        rag,
        metrics: Metrics::new(),
        mode: config.mode,
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;

    tracing::info!(addr = %config.bind_addr, mode = ?config.mode, "Server listening");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/query", post(run_query))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn provider_status(provider: &dyn ModelProvider) -> ProviderStatus {
    ProviderStatus {
        name: provider.name().to_string(),
        available: provider.is_available(),
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let gateway = state.rag.gateway();
    Json(HealthResponse {
        status: if gateway.is_available() { "ok" } else { "degraded" },
        mode: state.mode,
        primary: provider_status(gateway.primary()),
        fallback: gateway.fallback().map(provider_status),
    })
}

async fn run_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<RagResponse>, ApiError> {
    let timer = TimedOperation::start();
    let result = answer(&state, req).await;

    match &result {
        Ok(response) => {
            state.metrics.record_request(true);
            state
                .metrics
                .record_query(timer.elapsed(), &response.answer.metadata);
        }
        Err(e) => {
            tracing::warn!(status = %e.status, error = %e.message, "Query failed");
            state.metrics.record_request(false);
        }
    }
    result.map(Json)
}

async fn answer(state: &AppState, req: QueryRequest) -> Result<RagResponse, ApiError> {
    let document = match (req.text, req.path) {
        (Some(text), None) => Document::from_text(text),
        (None, Some(path)) => {
            let path = PathBuf::from(path);
            if !path.is_file() {
                return Err(ApiError::not_found(format!("no such file: {}", path.display())));
            }
            FileReader::read_document(&path)
                .await
                .map_err(|e| ApiError::bad_request(format!("{:#}", e)))?
        }
        _ => return Err(ApiError::bad_request("provide exactly one of `text` or `path`")),
    };

    let request = RagRequest::new(req.query, document).with_options(req.options);
    Ok(state.rag.process(request).await?)
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
