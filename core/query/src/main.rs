use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use graphrag_query::{
    Config, OpenAiChat, OpenAiEmbedder, QaPipeline, QueryError, Store, ThreadManager,
};
use graphrag_schemas::{
    FeedbackRequest, QueryRequest, ThreadCreateRequest, ThreadMessageRequest,
};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{error, info, Level};
use tracing_subscriber;

#[derive(Clone)]
struct AppState {
    pipeline: Arc<QaPipeline>,
    threads: Arc<ThreadManager>,
    store: Arc<Mutex<Store>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("GraphRAG QA Service v0.1.0");

    let config = Config::from_env()?;

    let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| "./graphrag.db".to_string());
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(Mutex::new(Store::new(&db_path)?));
    info!("Store opened at: {}", db_path);

    let embedder = Arc::new(OpenAiEmbedder::new(
        config.openai_api_key.clone(),
        config.embedding_model.clone(),
        config.openai_base_url.clone(),
        Duration::from_secs(config.embed_timeout_secs),
    ));
    let chat = Arc::new(OpenAiChat::new(
        config.openai_api_key.clone(),
        config.generation_model.clone(),
        config.openai_base_url.clone(),
        config.llm_max_inflight,
        Duration::from_secs(config.llm_timeout_secs),
    ));

    let pipeline = Arc::new(QaPipeline::new(
        store.clone(),
        embedder.clone(),
        chat.clone(),
        config.clone(),
    ));
    let threads = Arc::new(ThreadManager::new(
        store.clone(),
        embedder,
        chat,
        config.clone(),
    ));

    let state = AppState {
        pipeline,
        threads,
        store,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        // Query pipeline
        .route("/query", post(process_query))
        .route("/query/simple", post(process_simple_query))
        .route("/query/classify-chunks", post(classify_chunks))
        .route("/query/generate-subquestions", post(generate_subquestions))
        .route("/query/verify-answer", post(verify_answer))
        // Memory administration
        .route("/memory/stats", get(memory_stats))
        .route("/memory/entry/:id", get(get_memory_entry))
        .route("/memory/entry/:id", delete(delete_memory_entry))
        .route("/memory/clear", delete(clear_memory))
        // Feedback
        .route("/feedback", post(save_feedback))
        .route("/favorites", get(get_favorites))
        // Threads
        .route("/thread/create", post(create_thread))
        .route("/threads", get(list_threads))
        .route("/thread/:id", get(get_thread))
        .route("/thread/message", post(add_thread_message))
        .with_state(state);

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Map a pipeline error onto its HTTP status.
fn reject(e: QueryError) -> (StatusCode, String) {
    error!("request failed: {e}");
    (e.status_code(), e.to_string())
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = {
        let store = state.store.lock().await;
        store.ping()
    };

    let (status, database) = match database {
        Ok(()) => ("healthy", "connected"),
        Err(_) => ("unhealthy", "unavailable"),
    };

    Json(serde_json::json!({
        "status": status,
        "timestamp": Utc::now().to_rfc3339(),
        "services": {
            "database": database,
            "api": "running"
        }
    }))
}

// ========== QUERY ==========

async fn process_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    info!("Processing query: {}", request.query);
    let response = state.pipeline.answer(&request).await.map_err(reject)?;
    Ok(Json(response))
}

async fn process_simple_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    info!("Processing simple query: {}", request.query);
    let response = state.pipeline.answer_simple(&request).await.map_err(reject)?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct ClassifyChunksRequest {
    query: String,
    chunk_ids: Vec<i64>,
}

async fn classify_chunks(
    State(state): State<AppState>,
    Json(request): Json<ClassifyChunksRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let classified = state
        .pipeline
        .classify_chunk_ids(&request.query, &request.chunk_ids)
        .await
        .map_err(reject)?;

    let body: Vec<serde_json::Value> = classified
        .into_iter()
        .map(|(chunk_id, relevant)| {
            serde_json::json!({ "chunk_id": chunk_id, "relevant": relevant })
        })
        .collect();
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct SubquestionsRequest {
    query: String,
    #[serde(default)]
    context: Option<String>,
}

async fn generate_subquestions(
    State(state): State<AppState>,
    Json(request): Json<SubquestionsRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let subquestions = state
        .pipeline
        .generate_subquestions(&request.query, request.context)
        .await
        .map_err(reject)?;
    Ok(Json(subquestions))
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    query: String,
    answer: String,
    #[serde(default)]
    context: Option<String>,
}

async fn verify_answer(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let score = state
        .pipeline
        .verify(&request.query, &request.answer, request.context)
        .await
        .map_err(reject)?;
    Ok(Json(serde_json::json!({ "score": score })))
}

// ========== MEMORY ==========

async fn memory_stats(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let stats = {
        let store = state.store.lock().await;
        store.memory_stats().map_err(reject)?
    };
    Ok(Json(stats))
}

async fn get_memory_entry(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let entry = {
        let store = state.store.lock().await;
        store.memory_get(id).map_err(reject)?
    };

    let Some(mut entry) = entry else {
        return Err(reject(QueryError::NotFound(format!("memory entry {id}"))));
    };
    // The raw embedding is large and internal; drop it from the payload.
    entry.embedding.clear();

    Ok(Json(entry))
}

async fn delete_memory_entry(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let deleted = {
        let store = state.store.lock().await;
        store.memory_delete(id).map_err(reject)?
    };

    if !deleted {
        return Err(reject(QueryError::NotFound(format!("memory entry {id}"))));
    }
    Ok(Json(serde_json::json!({
        "status": "success",
        "deleted_id": id
    })))
}

async fn clear_memory(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let deleted = {
        let store = state.store.lock().await;
        store.memory_clear().map_err(reject)?
    };
    Ok(Json(serde_json::json!({
        "status": "success",
        "deleted_entries": deleted
    })))
}

// ========== FEEDBACK ==========

async fn save_feedback(
    State(state): State<AppState>,
    Json(request): Json<FeedbackRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if let Some(rating) = request.rating {
        if !(1..=5).contains(&rating) {
            return Err(reject(QueryError::BadInput(
                "rating must be between 1 and 5".into(),
            )));
        }
    }

    let id = {
        let store = state.store.lock().await;
        store
            .feedback_upsert(
                request.memory_id,
                request.feedback_text.as_deref(),
                request.rating,
                request.is_favorite,
            )
            .map_err(reject)?
    };

    Ok(Json(serde_json::json!({
        "status": "success",
        "id": id
    })))
}

async fn get_favorites(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let favorites = {
        let store = state.store.lock().await;
        store.favorites().map_err(reject)?
    };
    Ok(Json(serde_json::json!({
        "status": "success",
        "favorites": favorites
    })))
}

// ========== THREADS ==========

async fn create_thread(
    State(state): State<AppState>,
    Json(request): Json<ThreadCreateRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let thread = state
        .threads
        .create(request.memory_id, &request.thread_title)
        .await
        .map_err(reject)?;

    Ok(Json(serde_json::json!({
        "status": "success",
        "thread_id": thread.id,
        "memory_id": thread.memory_id,
        "title": thread.title
    })))
}

async fn list_threads(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let threads = state.threads.list().await.map_err(reject)?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "threads": threads
    })))
}

async fn get_thread(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let thread = state.threads.get(id).await.map_err(reject)?;
    Ok(Json(thread))
}

async fn add_thread_message(
    State(state): State<AppState>,
    Json(request): Json<ThreadMessageRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let result = state.threads.append(&request).await.map_err(reject)?;

    Ok(Json(serde_json::json!({
        "status": "success",
        "user_message_id": result.user_message.id,
        "assistant_message_id": result.assistant_message.id,
        "response": result.assistant_message.message,
        "references": result.assistant_message.references,
        "chunks": result.chunks
    })))
}
