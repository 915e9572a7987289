use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::{Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use kb_agent::admin;
use kb_agent::config::AppConfig;
use kb_agent::conversation::{ContextAssembler, ConversationStore};
use kb_agent::db::PgStore;
use kb_agent::error::KbError;
use kb_agent::generator::ChatCompletionGenerator;
use kb_agent::indexer::collect_documents;
use kb_agent::models::{DocumentUpload, InboundQuery, StoreCounts};
use kb_agent::pipeline::QueryPipeline;
use kb_agent::rag::{build_embedder, DocumentLoader, ScanRetriever, TopicStore};
use kb_agent::retry::RetryPolicy;

struct AppState {
    loader: DocumentLoader,
    pipeline: QueryPipeline,
    generator: Arc<ChatCompletionGenerator>,
    topics: Arc<dyn TopicStore>,
    conversations: Arc<dyn ConversationStore>,
}

type ApiError = (StatusCode, String);

fn api_error(context: &str, err: KbError) -> ApiError {
    let status = match &err {
        KbError::EmbeddingDimensionMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        KbError::EmbeddingProvider(_) | KbError::Generation(_) | KbError::StoreUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        KbError::Config(_) | KbError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::error!("{} error: {}", context, err);
    (status, format!("{} error: {}", context, err))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load()?;

    tracing::info!("Connecting to database");
    tracing::info!("Embedding provider: {} ({:?})", config.embedding.model, config.embedding.backend);
    tracing::info!("Generation endpoint: {} ({})", config.generation.base_url, config.generation.model);

    let store = Arc::new(PgStore::connect(&config.database).await?);
    store.init_schema().await?;
    let topics: Arc<dyn TopicStore> = store.clone();
    let conversations: Arc<dyn ConversationStore> = store;

    let embedder = build_embedder(&config.embedding)?;
    let retry = RetryPolicy::new(&config.retry);

    let loader = DocumentLoader::new(
        embedder.clone(),
        topics.clone(),
        retry.clone(),
        &config.chunking,
        &config.embedding,
    );
    let retriever = ScanRetriever::new(embedder, topics.clone(), retry.clone(), &config.retrieval);
    let generator = Arc::new(ChatCompletionGenerator::new(&config.generation)?);
    let mut assembler = ContextAssembler::new(
        conversations.clone(),
        Arc::new(retriever),
        &config.conversation,
        &config.retrieval,
    )?;
    if config.retrieval.rephrase_query {
        assembler = assembler.with_rephraser(generator.clone());
    }
    let pipeline = QueryPipeline::new(
        conversations.clone(),
        assembler,
        generator.clone(),
        retry,
        &config.conversation,
        &config.generation,
    );

    let state = Arc::new(AppState {
        loader,
        pipeline,
        generator,
        topics,
        conversations,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/v1/documents", post(add_documents_handler))
        .route("/api/v1/documents/directory", post(load_directory_handler))
        .route("/api/v1/query", post(query_handler))
        .route("/api/v1/admin/clear", post(clear_handler))
        .route("/api/v1/admin/status", get(status_handler))
        .route("/api/health", get(health_check))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    tracing::info!("Knowledge-base agent listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn add_documents_handler(
    State(state): State<Arc<AppState>>,
    Json(documents): Json<Vec<DocumentUpload>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let report = state
        .loader
        .load(&documents)
        .await
        .map_err(|e| api_error("Document load", e))?;

    Ok(Json(serde_json::json!({
        "status": "success",
        "documents": report.documents,
        "topics_created": report.topics_created,
    })))
}

#[derive(Deserialize)]
struct DirectoryRequest {
    path: PathBuf,
}

async fn load_directory_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DirectoryRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let path = request.path;
    let collected = tokio::task::spawn_blocking(move || collect_documents(&path))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Worker error: {}", e)))?
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("{:#}", e)))?;

    let report = state
        .loader
        .load(&collected.documents)
        .await
        .map_err(|e| api_error("Document load", e))?;

    let failed: Vec<String> = collected
        .failed_files
        .iter()
        .map(|(path, _)| path.display().to_string())
        .collect();

    Ok(Json(serde_json::json!({
        "status": "success",
        "documents": report.documents,
        "topics_created": report.topics_created,
        "failed_files": failed,
        "empty_files": collected.empty_files.len(),
    })))
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Json(query): Json<InboundQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if query.sender.trim().is_empty() || query.message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "sender and message are required".to_string()));
    }

    let reply = state
        .pipeline
        .handle(query)
        .await
        .map_err(|e| api_error("Query", e))?;

    Ok(Json(serde_json::json!({ "reply": reply })))
}

async fn clear_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StoreCounts>, ApiError> {
    let removed = admin::clear_all(state.topics.as_ref(), state.conversations.as_ref())
        .await
        .map_err(|e| api_error("Clear", e))?;
    Ok(Json(removed))
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StoreCounts>, ApiError> {
    let counts = admin::status(state.topics.as_ref(), state.conversations.as_ref())
        .await
        .map_err(|e| api_error("Status", e))?;
    Ok(Json(counts))
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let generator_healthy = state.generator.health_check().await.unwrap_or(false);

    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "services": {
            "generator": {
                "model": state.pipeline.generator_name(),
                "reachable": generator_healthy
            }
        }
    }))
}
