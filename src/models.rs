//! Core data models used throughout the engine.
//!
//! These types represent the documents, chunks, entities, and retrieval
//! results that flow through the ingestion and query pipelines. Ids are
//! UUID strings; timestamps are Unix seconds.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Document format accepted by ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    Pdf,
    Text,
    Markdown,
    Docx,
    Url,
    Raw,
}

impl DocType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdf" => Some(DocType::Pdf),
            "text" | "txt" => Some(DocType::Text),
            "markdown" | "md" => Some(DocType::Markdown),
            "docx" => Some(DocType::Docx),
            "url" => Some(DocType::Url),
            "raw" => Some(DocType::Raw),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Pdf => "pdf",
            DocType::Text => "text",
            DocType::Markdown => "markdown",
            DocType::Docx => "docx",
            DocType::Url => "url",
            DocType::Raw => "raw",
        }
    }
}

/// Lifecycle status of an ingested document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    Processing,
    Completed,
    Failed,
}

impl DocStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(DocStatus::Processing),
            "completed" => Some(DocStatus::Completed),
            "failed" => Some(DocStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocStatus::Processing => "processing",
            DocStatus::Completed => "completed",
            DocStatus::Failed => "failed",
        }
    }
}

/// Document record stored in SQLite. Mutated only to change status; delete
/// cascades to chunks and entity-chunk links.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub doc_type: String,
    pub file_path: Option<String>,
    pub source_url: Option<String>,
    pub size_bytes: i64,
    pub status: String,
    pub tags: Vec<String>,
    pub created_at: i64,
}

/// A contiguous character span of one document; the unit of retrieval.
/// Immutable after insert.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: String,
    pub doc_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub start_char: i64,
    pub end_char: i64,
    pub page_number: Option<i64>,
}

/// A chunk hydrated for retrieval, carrying its similarity score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    #[serde(flatten)]
    pub chunk: Chunk,
    /// Similarity derived from vector distance: 1 / (1 + distance).
    pub score: f64,
}

/// A named concept extracted from text; node in the knowledge graph.
/// `(name, entity_type)` is unique.
#[derive(Debug, Clone, Serialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub aliases: Vec<String>,
}

/// Directed labeled edge between two entities.
#[derive(Debug, Clone, Serialize)]
pub struct Relation {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub label: String,
    pub confidence: Option<f64>,
    pub chunk_id: Option<String>,
}

/// Append-only record of a served query.
#[derive(Debug, Clone, Serialize)]
pub struct ProvenanceLog {
    pub id: String,
    pub question: String,
    pub answer: String,
    pub mode_used: String,
    pub confidence: f64,
    pub chunk_ids: Vec<String>,
    pub processing_time_ms: f64,
    pub session_id: Option<String>,
    pub created_at: i64,
}

/// Retrieval mode for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Speed,
    Deep,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Speed => "speed",
            Mode::Deep => "deep",
        }
    }
}

/// Counters describing the shape of one retrieval, used by confidence
/// scoring and the query response metadata.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalMeta {
    pub mode: String,
    pub chunks_retrieved: usize,
    pub documents_used: usize,
    pub graph_paths_found: usize,
    pub entities_expanded: usize,
    pub reranked: bool,
}

/// Output of either retriever: hydrated chunks in rank order, their
/// documents, the assembled context, and (deep mode) the graph evidence.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalResult {
    pub chunks: Vec<ScoredChunk>,
    pub documents: HashMap<String, Document>,
    /// Node-id sequences from the knowledge graph, shortest first.
    pub graph_paths: Vec<Vec<String>>,
    pub query_entities: Vec<String>,
    pub expanded_entities: Vec<String>,
    pub context: String,
    pub metadata: RetrievalMeta,
}

impl RetrievalResult {
    /// Empty result for the given mode; context stays "" so the engine
    /// returns the canned insufficient-information answer.
    pub fn empty(mode: Mode) -> Self {
        RetrievalResult {
            metadata: RetrievalMeta {
                mode: mode.as_str().to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Final answer produced by the hybrid engine.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub answer: String,
    pub confidence: f64,
    pub mode_used: Mode,
    /// Complexity score from the selector; `None` when the caller forced
    /// the mode.
    pub selection_score: Option<f64>,
    pub retrieval: RetrievalResult,
    pub processing_time_ms: f64,
}
