//! Speed-mode retriever: vector similarity only.
//!
//! The fast path for straightforward factual queries. Searches the vector
//! index, hydrates the hits from the chunk store in rank order, loads each
//! referenced document once, and assembles a flat context string. Every step
//! failing is fatal to the retrieval; there is no degraded fallback here.

use sqlx::SqlitePool;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::models::{Document, Mode, RetrievalMeta, RetrievalResult, ScoredChunk};
use crate::store;
use crate::vector_index::VectorIndex;

pub struct SpeedRetriever {
    index: Arc<VectorIndex>,
    pool: SqlitePool,
    top_k: usize,
}

impl SpeedRetriever {
    pub fn new(index: Arc<VectorIndex>, pool: SqlitePool, top_k: usize) -> Self {
        Self { index, pool, top_k }
    }

    /// Retrieve the `top_k` most similar chunks and assemble their context.
    pub async fn retrieve(&self, query: &str, top_k: Option<usize>) -> Result<RetrievalResult> {
        let k = top_k.unwrap_or(self.top_k);
        tracing::debug!(k, "speed retrieval");

        let hits = self.index.search(query, k).await?;
        if hits.is_empty() {
            return Ok(RetrievalResult::empty(Mode::Speed));
        }

        let mut chunks = Vec::with_capacity(hits.len());
        for (chunk_id, distance) in &hits {
            if let Some(chunk) = store::get_chunk(&self.pool, chunk_id).await? {
                chunks.push(ScoredChunk {
                    chunk,
                    score: 1.0 / (1.0 + *distance as f64),
                });
            }
        }

        let documents = load_documents(&self.pool, &chunks).await?;
        let context = build_context(chunks.iter(), &documents, "\n\n---\n\n");

        let metadata = RetrievalMeta {
            mode: Mode::Speed.as_str().to_string(),
            chunks_retrieved: chunks.len(),
            documents_used: documents.len(),
            ..Default::default()
        };

        Ok(RetrievalResult {
            chunks,
            documents,
            context,
            metadata,
            ..Default::default()
        })
    }

    /// Over-fetch, rerank by query-term overlap, and keep the best
    /// `rerank_top_n` chunks.
    pub async fn retrieve_with_reranking(
        &self,
        query: &str,
        top_k: Option<usize>,
        rerank_top_n: usize,
    ) -> Result<RetrievalResult> {
        let fetch_k = top_k.unwrap_or(rerank_top_n * 2);
        let mut result = self.retrieve(query, Some(fetch_k)).await?;

        if result.chunks.is_empty() {
            return Ok(result);
        }

        let query_terms: HashSet<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(|t| t.to_string())
            .collect();

        let mut reranked: Vec<(f64, ScoredChunk)> = result
            .chunks
            .into_iter()
            .map(|sc| (term_overlap(&query_terms, &sc.chunk.content), sc))
            .collect();

        // Stable sort keeps the original rank order for equal overlap.
        reranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        reranked.truncate(rerank_top_n);

        result.chunks = reranked.into_iter().map(|(_, sc)| sc).collect();
        result.context = build_context(result.chunks.iter(), &result.documents, "\n\n---\n\n");
        result.metadata.chunks_retrieved = result.chunks.len();
        result.metadata.reranked = true;

        Ok(result)
    }
}

/// Fraction of the query's terms that appear in `content`.
pub(crate) fn term_overlap(query_terms: &HashSet<String>, content: &str) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let content_terms: HashSet<String> = content
        .to_lowercase()
        .split_whitespace()
        .map(|t| t.to_string())
        .collect();
    let overlap = query_terms.intersection(&content_terms).count();
    overlap as f64 / query_terms.len() as f64
}

/// Load every document referenced by `chunks`, each exactly once.
pub(crate) async fn load_documents(
    pool: &SqlitePool,
    chunks: &[ScoredChunk],
) -> Result<HashMap<String, Document>> {
    let mut documents = HashMap::new();
    for sc in chunks {
        if !documents.contains_key(&sc.chunk.doc_id) {
            if let Some(doc) = store::get_document(pool, &sc.chunk.doc_id).await? {
                documents.insert(sc.chunk.doc_id.clone(), doc);
            }
        }
    }
    Ok(documents)
}

/// Render chunks as `[Source: <title>]\n<content>` blocks joined by `sep`,
/// in the order given.
pub(crate) fn build_context<'a>(
    chunks: impl Iterator<Item = &'a ScoredChunk>,
    documents: &HashMap<String, Document>,
    sep: &str,
) -> String {
    chunks
        .map(|sc| {
            let title = documents
                .get(&sc.chunk.doc_id)
                .map(|d| d.title.as_str())
                .unwrap_or("Unknown");
            format!("[Source: {}]\n{}", title, sc.chunk.content)
        })
        .collect::<Vec<_>>()
        .join(sep)
}
