//! HTTP API server.
//!
//! Exposes the engine over JSON HTTP under the `/api` prefix.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/ingest` | Ingest a document (multipart: file, url, or content) |
//! | `GET`  | `/api/documents` | List documents (limit, offset, status) |
//! | `GET`  | `/api/documents/{doc_id}` | Document details + chunk count |
//! | `DELETE` | `/api/documents/{doc_id}` | Delete a document everywhere |
//! | `POST` | `/api/query` | Answer a question (auto/speed/deep) |
//! | `POST` | `/api/query/stream` | Stream the answer as plain text |
//! | `GET`  | `/api/query/history` | Recent provenance rows |
//! | `GET`  | `/api/system/status` | Status and counters |
//! | `GET`  | `/api/system/metrics` | Index/graph stats, per-mode metrics |
//! | `GET`  | `/api/system/health` | Health probe |
//!
//! # Error Contract
//!
//! Errors are JSON bodies of the shape `{"error": <code>, "message": <text>}`
//! with status 400 (invalid input), 404 (unknown id), or 500 (internal).

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Multipart, Path as AxumPath, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::context::AppContext;
use crate::engine::QueryMode;
use crate::error::EngineError;
use crate::ingest::{self, IngestOutcome, IngestRequest};
use crate::models::{DocStatus, DocType, Document, Mode, ProvenanceLog, QueryOutcome};
use crate::status;
use crate::store;

type AppState = Arc<AppContext>;

/// Starts the HTTP server on the configured bind address. Runs until the
/// process is terminated.
pub async fn run_server(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();
    let cors = cors_layer(&ctx.config.server.cors_origins);

    let app = Router::new()
        .route("/api/ingest", post(handle_ingest))
        .route("/api/documents", get(handle_list_documents))
        .route(
            "/api/documents/{doc_id}",
            get(handle_get_document).delete(handle_delete_document),
        )
        .route("/api/query", post(handle_query))
        .route("/api/query/stream", post(handle_query_stream))
        .route("/api/query/history", get(handle_query_history))
        .route("/api/system/status", get(handle_system_status))
        .route("/api/system/metrics", get(handle_system_metrics))
        .route("/api/system/health", get(handle_health))
        .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
        .layer(cors)
        .with_state(ctx);

    tracing::info!(%bind_addr, "API server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| o.parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(parsed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

// ============ Error response ============

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::InvalidInput(msg) => bad_request(msg),
            EngineError::NotFound(msg) => not_found(msg),
            other => internal_error(other.to_string()),
        }
    }
}

// ============ POST /api/ingest ============

async fn handle_ingest(
    State(ctx): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<IngestOutcome>, AppError> {
    let mut file = None;
    let mut url = None;
    let mut content = None;
    let mut doc_type = None;
    let mut title = None;
    let mut tags = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field
                    .file_name()
                    .unwrap_or("upload")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("failed to read file field: {}", e)))?;
                file = Some((filename, bytes.to_vec()));
            }
            "url" => url = Some(read_text_field(field).await?),
            "content" => content = Some(read_text_field(field).await?),
            "doc_type" => doc_type = Some(read_text_field(field).await?),
            "title" => title = Some(read_text_field(field).await?),
            "tags" => tags = Some(read_text_field(field).await?),
            _ => {}
        }
    }

    let doc_type = doc_type.ok_or_else(|| bad_request("doc_type is required"))?;
    let doc_type = DocType::parse(&doc_type)
        .ok_or_else(|| bad_request(format!("unknown doc_type: {}", doc_type)))?;

    if file.is_none() && url.is_none() && content.is_none() {
        return Err(bad_request("must provide file, url, or content"));
    }

    let outcome = ingest::ingest_document(
        &ctx,
        IngestRequest {
            file,
            url,
            content,
            doc_type,
            title,
            tags,
        },
    )
    .await?;

    Ok(Json(outcome))
}

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, AppError> {
    field
        .text()
        .await
        .map_err(|e| bad_request(format!("failed to read field: {}", e)))
}

// ============ GET /api/documents ============

#[derive(Deserialize)]
struct ListParams {
    #[serde(default = "default_list_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
    status: Option<String>,
}

fn default_list_limit() -> i64 {
    100
}

#[derive(Serialize)]
struct ListResponse {
    documents: Vec<Document>,
    total: usize,
    limit: i64,
    offset: i64,
}

async fn handle_list_documents(
    State(ctx): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, AppError> {
    let status = match params.status.as_deref() {
        Some(s) => Some(
            DocStatus::parse(s).ok_or_else(|| bad_request(format!("unknown status: {}", s)))?,
        ),
        None => None,
    };

    let documents = store::list_documents(&ctx.pool, params.limit, params.offset, status).await?;
    let total = documents.len();

    Ok(Json(ListResponse {
        documents,
        total,
        limit: params.limit,
        offset: params.offset,
    }))
}

// ============ GET /api/documents/{doc_id} ============

#[derive(Serialize)]
struct DocumentResponse {
    document: Document,
    chunk_count: usize,
}

async fn handle_get_document(
    State(ctx): State<AppState>,
    AxumPath(doc_id): AxumPath<String>,
) -> Result<Json<DocumentResponse>, AppError> {
    let document = store::get_document(&ctx.pool, &doc_id)
        .await?
        .ok_or_else(|| not_found(format!("document {}", doc_id)))?;

    let chunks = store::get_chunks_by_doc(&ctx.pool, &doc_id).await?;

    Ok(Json(DocumentResponse {
        document,
        chunk_count: chunks.len(),
    }))
}

// ============ DELETE /api/documents/{doc_id} ============

#[derive(Serialize)]
struct DeleteResponse {
    message: String,
}

async fn handle_delete_document(
    State(ctx): State<AppState>,
    AxumPath(doc_id): AxumPath<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    ingest::delete_document(&ctx, &doc_id).await?;

    Ok(Json(DeleteResponse {
        message: format!("Document {} deleted successfully", doc_id),
    }))
}

// ============ POST /api/query ============

#[derive(Deserialize)]
struct QueryRequest {
    question: String,
    #[serde(default)]
    mode: QueryMode,
    top_k: Option<usize>,
    max_hops: Option<usize>,
    #[serde(default = "default_true")]
    include_provenance: bool,
    #[serde(default)]
    include_reasoning: bool,
    session_id: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
struct ChunkInfo {
    chunk_id: String,
    doc_id: String,
    doc_title: String,
    content: String,
    score: f64,
    page_number: Option<i64>,
}

#[derive(Serialize)]
struct GraphPathInfo {
    entities: Vec<String>,
}

#[derive(Serialize)]
struct ProvenanceInfo {
    chunks: Vec<ChunkInfo>,
    graph_paths: Vec<GraphPathInfo>,
    documents_used: Vec<String>,
    retrieval_mode: Mode,
    total_sources: usize,
}

#[derive(Serialize)]
struct ReasoningStep {
    agent: &'static str,
    action: String,
    result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    confidence: Option<f64>,
    timestamp: i64,
}

#[derive(Serialize)]
struct QueryResponse {
    answer: String,
    confidence: f64,
    mode_used: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    provenance: Option<ProvenanceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_steps: Option<Vec<ReasoningStep>>,
    processing_time_ms: f64,
    cached: bool,
}

/// Provenance rendered from a query outcome: at most 10 chunks with content
/// truncated to 500 characters, at most 5 graph paths as entity names.
fn build_provenance(ctx: &AppContext, outcome: &QueryOutcome) -> ProvenanceInfo {
    let chunks: Vec<ChunkInfo> = outcome
        .retrieval
        .chunks
        .iter()
        .take(10)
        .map(|sc| {
            let doc_title = outcome
                .retrieval
                .documents
                .get(&sc.chunk.doc_id)
                .map(|d| d.title.clone())
                .unwrap_or_else(|| "Unknown".to_string());
            ChunkInfo {
                chunk_id: sc.chunk.id.clone(),
                doc_id: sc.chunk.doc_id.clone(),
                doc_title,
                content: sc.chunk.content.chars().take(500).collect(),
                score: sc.score,
                page_number: sc.chunk.page_number,
            }
        })
        .collect();

    let graph_paths: Vec<GraphPathInfo> = outcome
        .retrieval
        .graph_paths
        .iter()
        .take(5)
        .map(|path| GraphPathInfo {
            entities: ctx.graph.node_names(path),
        })
        .filter(|p| !p.entities.is_empty())
        .collect();

    let total_sources = chunks.len();

    ProvenanceInfo {
        chunks,
        graph_paths,
        documents_used: outcome
            .retrieval
            .documents
            .values()
            .map(|d| d.title.clone())
            .collect(),
        retrieval_mode: outcome.mode_used,
        total_sources,
    }
}

fn build_reasoning_steps(ctx: &AppContext, outcome: &QueryOutcome) -> Vec<ReasoningStep> {
    let now = chrono::Utc::now().timestamp();
    vec![
        ReasoningStep {
            agent: "ModeSelector",
            action: format!("Selected {} mode", outcome.mode_used.as_str()),
            result: match outcome.selection_score {
                Some(score) => ctx
                    .engine
                    .selector()
                    .explain_selection(outcome.mode_used, score),
                None => "Mode specified by request".to_string(),
            },
            confidence: None,
            timestamp: now,
        },
        ReasoningStep {
            agent: "Retriever",
            action: format!(
                "Retrieved {} chunks",
                outcome.retrieval.metadata.chunks_retrieved
            ),
            result: "Context assembled".to_string(),
            confidence: Some(outcome.confidence),
            timestamp: now,
        },
        ReasoningStep {
            agent: "Generator",
            action: "Generated answer using LM".to_string(),
            result: "Answer completed".to_string(),
            confidence: Some(outcome.confidence),
            timestamp: now,
        },
    ]
}

async fn handle_query(
    State(ctx): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let outcome = ctx
        .engine
        .query(
            &req.question,
            req.mode,
            req.top_k,
            req.max_hops,
            req.session_id.clone(),
        )
        .await?;

    let provenance = req
        .include_provenance
        .then(|| build_provenance(&ctx, &outcome));
    let reasoning_steps = req
        .include_reasoning
        .then(|| build_reasoning_steps(&ctx, &outcome));

    Ok(Json(QueryResponse {
        answer: outcome.answer,
        confidence: outcome.confidence,
        mode_used: outcome.mode_used,
        provenance,
        reasoning_steps,
        processing_time_ms: outcome.processing_time_ms,
        cached: false,
    }))
}

// ============ POST /api/query/stream ============

async fn handle_query_stream(
    State(ctx): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Response, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let stream = ctx.engine.query_stream(&req.question, req.mode).await?;
    let body = Body::from_stream(stream.map(|r| r.map(Bytes::from)));

    Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body)
        .map_err(|e| internal_error(e.to_string()))
}

// ============ GET /api/query/history ============

#[derive(Deserialize)]
struct HistoryParams {
    #[serde(default = "default_history_limit")]
    limit: i64,
    session_id: Option<String>,
}

fn default_history_limit() -> i64 {
    50
}

#[derive(Serialize)]
struct HistoryResponse {
    history: Vec<ProvenanceLog>,
    total: usize,
}

async fn handle_query_history(
    State(ctx): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, AppError> {
    let history =
        store::query_history(&ctx.pool, params.limit, params.session_id.as_deref()).await?;
    let total = history.len();

    Ok(Json(HistoryResponse { history, total }))
}

// ============ GET /api/system/* ============

async fn handle_system_status(
    State(ctx): State<AppState>,
) -> Result<Json<status::SystemStatus>, AppError> {
    Ok(Json(status::system_status(&ctx).await?))
}

async fn handle_system_metrics(
    State(ctx): State<AppState>,
) -> Result<Json<status::DetailedMetrics>, AppError> {
    Ok(Json(status::detailed_metrics(&ctx).await?))
}

async fn handle_health(State(ctx): State<AppState>) -> Json<status::Health> {
    Json(status::health(&ctx).await)
}
