//! Hybrid query engine.
//!
//! Drives the full answer pipeline: mode selection, retrieval dispatch, LM
//! synthesis with retry, deterministic confidence scoring, and provenance
//! logging. Streaming queries run the same retrieval steps and then relay
//! the LM's output fragments as they arrive.

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::Result;
use crate::llm::{generate_with_retry, LanguageModel};
use crate::mode::ModeSelector;
use crate::models::{Mode, ProvenanceLog, QueryOutcome, RetrievalMeta, RetrievalResult};
use crate::retriever_deep::DeepRetriever;
use crate::retriever_speed::SpeedRetriever;
use crate::store;

/// Mode requested by the caller; `Auto` defers to the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    #[default]
    Auto,
    Speed,
    Deep,
}

const ANSWER_TEMPERATURE: f32 = 0.3;
const ANSWER_MAX_TOKENS: u32 = 512;

const INSUFFICIENT_ANSWER: &str = "I don't have enough information to answer this question. \
Please try uploading relevant documents first.";

const INSUFFICIENT_ANSWER_STREAM: &str =
    "I don't have enough information to answer this question.";

const SPEED_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. Answer the question based ONLY on the provided context.
If the context doesn't contain enough information, say so.
Be concise and direct.";

const DEEP_SYSTEM_PROMPT: &str = "You are a helpful AI assistant with access to a knowledge graph.
Answer the question by synthesizing information from multiple sources.
Use the knowledge graph paths to understand relationships between concepts.
Provide a comprehensive answer that connects different pieces of information.
If there are contradictions, mention them.";

const STREAM_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Answer based on the provided context.";

pub struct HybridEngine {
    selector: ModeSelector,
    speed: SpeedRetriever,
    deep: DeepRetriever,
    lm: Arc<dyn LanguageModel>,
    pool: SqlitePool,
    max_retries: u32,
}

impl HybridEngine {
    pub fn new(
        selector: ModeSelector,
        speed: SpeedRetriever,
        deep: DeepRetriever,
        lm: Arc<dyn LanguageModel>,
        pool: SqlitePool,
        max_retries: u32,
    ) -> Self {
        Self {
            selector,
            speed,
            deep,
            lm,
            pool,
            max_retries,
        }
    }

    pub fn selector(&self) -> &ModeSelector {
        &self.selector
    }

    /// Answer a question. Auto mode consults the selector; the chosen
    /// retriever assembles context; the LM synthesizes; a provenance row is
    /// appended (a logging failure is warned about, never fatal).
    pub async fn query(
        &self,
        question: &str,
        mode: QueryMode,
        top_k: Option<usize>,
        max_hops: Option<usize>,
        session_id: Option<String>,
    ) -> Result<QueryOutcome> {
        let start = Instant::now();

        let (mode, selection_score) = self.resolve_mode(question, mode).await;
        tracing::info!(mode = mode.as_str(), question = %truncate_for_log(question), "processing query");

        let retrieval = self.retrieve(question, mode, top_k, max_hops).await?;

        if retrieval.context.is_empty() {
            let outcome = QueryOutcome {
                answer: INSUFFICIENT_ANSWER.to_string(),
                confidence: 0.0,
                mode_used: mode,
                selection_score,
                retrieval,
                processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            };
            self.log_provenance(question, &outcome, session_id).await;
            return Ok(outcome);
        }

        let system = match mode {
            Mode::Speed => SPEED_SYSTEM_PROMPT,
            Mode::Deep => DEEP_SYSTEM_PROMPT,
        };
        let prompt = build_prompt(&retrieval.context, question);

        let answer = generate_with_retry(
            self.lm.as_ref(),
            &prompt,
            Some(system),
            ANSWER_TEMPERATURE,
            ANSWER_MAX_TOKENS,
            self.max_retries,
        )
        .await?;

        let confidence = calculate_confidence(&retrieval.metadata, &answer);
        let processing_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        tracing::info!(
            processing_time_ms = processing_time_ms as u64,
            confidence,
            "query processed"
        );

        let outcome = QueryOutcome {
            answer,
            confidence,
            mode_used: mode,
            selection_score,
            retrieval,
            processing_time_ms,
        };
        self.log_provenance(question, &outcome, session_id).await;

        Ok(outcome)
    }

    /// Streaming variant: same selection and retrieval, then the LM's
    /// fragments verbatim. No confidence is computed and no provenance row
    /// is written for streams.
    pub async fn query_stream(
        &self,
        question: &str,
        mode: QueryMode,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let (mode, _score) = self.resolve_mode(question, mode).await;
        let retrieval = self.retrieve(question, mode, None, None).await?;

        if retrieval.context.is_empty() {
            let canned: Vec<Result<String>> = vec![Ok(INSUFFICIENT_ANSWER_STREAM.to_string())];
            return Ok(futures::stream::iter(canned).boxed());
        }

        let prompt = build_prompt(&retrieval.context, question);
        self.lm
            .generate_stream(
                &prompt,
                Some(STREAM_SYSTEM_PROMPT),
                ANSWER_TEMPERATURE,
                ANSWER_MAX_TOKENS,
            )
            .await
    }

    async fn resolve_mode(&self, question: &str, mode: QueryMode) -> (Mode, Option<f64>) {
        match mode {
            QueryMode::Speed => (Mode::Speed, None),
            QueryMode::Deep => (Mode::Deep, None),
            QueryMode::Auto => {
                let (mode, score) = self.selector.select_mode(question).await;
                (mode, Some(score))
            }
        }
    }

    async fn retrieve(
        &self,
        question: &str,
        mode: Mode,
        top_k: Option<usize>,
        max_hops: Option<usize>,
    ) -> Result<RetrievalResult> {
        match mode {
            Mode::Speed => self.speed.retrieve(question, top_k).await,
            Mode::Deep => self.deep.retrieve(question, top_k, max_hops).await,
        }
    }

    async fn log_provenance(
        &self,
        question: &str,
        outcome: &QueryOutcome,
        session_id: Option<String>,
    ) {
        let log = ProvenanceLog {
            id: Uuid::new_v4().to_string(),
            question: question.to_string(),
            answer: outcome.answer.clone(),
            mode_used: outcome.mode_used.as_str().to_string(),
            confidence: outcome.confidence,
            chunk_ids: outcome
                .retrieval
                .chunks
                .iter()
                .map(|sc| sc.chunk.id.clone())
                .collect(),
            processing_time_ms: outcome.processing_time_ms,
            session_id,
            created_at: chrono::Utc::now().timestamp(),
        };

        if let Err(e) = store::insert_provenance_log(&self.pool, &log).await {
            tracing::warn!(error = %e, "failed to write provenance log");
        }
    }
}

fn build_prompt(context: &str, question: &str) -> String {
    format!("Context:\n{}\n\nQuestion: {}\n\nAnswer:", context, question)
}

fn truncate_for_log(s: &str) -> String {
    s.chars().take(100).collect()
}

/// Deterministic confidence in `[0, 1]`, derived from the retrieval shape
/// and a couple of answer heuristics. Starts at 0.5.
pub fn calculate_confidence(meta: &RetrievalMeta, answer: &str) -> f64 {
    let mut confidence: f64 = 0.5;

    if meta.chunks_retrieved >= 5 {
        confidence += 0.2;
    } else if meta.chunks_retrieved >= 3 {
        confidence += 0.1;
    }

    if meta.documents_used >= 3 {
        confidence += 0.15;
    } else if meta.documents_used >= 2 {
        confidence += 0.1;
    }

    if meta.mode == Mode::Deep.as_str() && meta.graph_paths_found > 0 {
        confidence += 0.1;
    }

    if answer.len() > 100 {
        confidence += 0.05;
    }

    if answer.contains("I don't") || answer.contains("not enough") {
        confidence -= 0.2;
    }

    confidence.clamp(0.0, 1.0)
}
