//! Deep-mode retriever: vector search plus knowledge-graph expansion.
//!
//! The multi-hop path for complex queries. Starts from a vector search,
//! mines the query for entities (falling back to token heuristics when the
//! LM is unavailable), walks the knowledge graph outward from those
//! entities, and pulls in extra chunks for entities the initial hits did not
//! cover. The assembled context carries the graph evidence so the generator
//! can reason across sources.

use sqlx::SqlitePool;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::graph::KnowledgeGraph;
use crate::llm::LanguageModel;
use crate::models::{Document, Mode, RetrievalMeta, RetrievalResult, ScoredChunk};
use crate::retriever_speed::load_documents;
use crate::store;
use crate::vector_index::VectorIndex;

/// Extra chunks fetched per expansion entity.
const CHUNKS_PER_EXPANSION_ENTITY: i64 = 2;
/// Paths rendered into the context.
const CONTEXT_MAX_PATHS: usize = 5;
/// Chunks rendered into the context.
const CONTEXT_MAX_CHUNKS: usize = 10;

pub struct DeepRetriever {
    index: Arc<VectorIndex>,
    graph: Arc<KnowledgeGraph>,
    lm: Arc<dyn LanguageModel>,
    pool: SqlitePool,
    top_k: usize,
    max_hops: usize,
    max_paths: usize,
}

impl DeepRetriever {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: Arc<VectorIndex>,
        graph: Arc<KnowledgeGraph>,
        lm: Arc<dyn LanguageModel>,
        pool: SqlitePool,
        top_k: usize,
        max_hops: usize,
        max_paths: usize,
    ) -> Self {
        Self {
            index,
            graph,
            lm,
            pool,
            top_k,
            max_hops,
            max_paths,
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        top_k: Option<usize>,
        max_hops: Option<usize>,
    ) -> Result<RetrievalResult> {
        let k = top_k.unwrap_or(self.top_k);
        let hops = max_hops.unwrap_or(self.max_hops);
        tracing::debug!(k, hops, "deep retrieval");

        // Step 1: initial vector hits anchor everything else.
        let hits = self.index.search(query, k).await?;
        if hits.is_empty() {
            return Ok(RetrievalResult::empty(Mode::Deep));
        }

        // Step 2: entities mentioned in the query itself.
        let query_entities = self.extract_query_entities(query).await;

        // Step 3: hydrate the hits and collect the entities their chunks
        // already mention.
        let mut chunks = Vec::with_capacity(hits.len());
        let mut chunk_entities: HashSet<String> = HashSet::new();
        for (chunk_id, distance) in &hits {
            let Some(chunk) = store::get_chunk(&self.pool, chunk_id).await? else {
                continue;
            };
            for name in store::entity_names_for_chunk(&self.pool, chunk_id).await? {
                chunk_entities.insert(name);
            }
            chunks.push(ScoredChunk {
                chunk,
                score: 1.0 / (1.0 + *distance as f64),
            });
        }

        // Step 4: walk the graph outward from each query entity.
        let mut graph_paths: Vec<Vec<String>> = Vec::new();
        let mut expanded_entities: Vec<String> = Vec::new();
        for entity in &query_entities {
            for path in self.graph.find_paths(entity, hops, self.max_paths) {
                for node_id in &path {
                    if let Some(node) = self.graph.get_node(node_id) {
                        if !expanded_entities.contains(&node.name) {
                            expanded_entities.push(node.name);
                        }
                    }
                }
                graph_paths.push(path);
            }
        }

        // Step 5: pull extra chunks for entities the initial hits missed.
        let mut seen_chunk_ids: HashSet<String> =
            chunks.iter().map(|sc| sc.chunk.id.clone()).collect();
        for name in expanded_entities
            .iter()
            .filter(|n| !chunk_entities.contains(*n))
        {
            let Some(entity) = store::get_entity_by_name(&self.pool, name).await? else {
                continue;
            };
            for chunk in
                store::chunks_for_entity(&self.pool, &entity.id, CHUNKS_PER_EXPANSION_ENTITY)
                    .await?
            {
                if seen_chunk_ids.insert(chunk.id.clone()) {
                    chunks.push(ScoredChunk { chunk, score: 0.0 });
                }
            }
        }

        // Step 6: document records for everything collected.
        let documents = load_documents(&self.pool, &chunks).await?;

        // Step 7: context with the graph evidence spelled out.
        let named_paths: Vec<Vec<String>> = graph_paths
            .iter()
            .map(|p| self.graph.node_names(p))
            .collect();
        let context = assemble_deep_context(&chunks, &documents, &named_paths, &query_entities);

        let metadata = RetrievalMeta {
            mode: Mode::Deep.as_str().to_string(),
            chunks_retrieved: chunks.len(),
            documents_used: documents.len(),
            graph_paths_found: graph_paths.len(),
            entities_expanded: expanded_entities.len(),
            ..Default::default()
        };

        Ok(RetrievalResult {
            chunks,
            documents,
            graph_paths,
            query_entities,
            expanded_entities,
            context,
            metadata,
        })
    }

    /// LM entity extraction with a token-heuristic fallback. A failure here
    /// degrades the query, it never fails it.
    async fn extract_query_entities(&self, query: &str) -> Vec<String> {
        match self.lm.extract_entities(query).await {
            Ok(extraction) => {
                let mut names = Vec::new();
                for entity in extraction.entities {
                    if !names.contains(&entity.name) {
                        names.push(entity.name);
                    }
                }
                names
            }
            Err(e) => {
                tracing::warn!(error = %e, "query entity extraction failed, using token fallback");
                fallback_query_entities(query)
            }
        }
    }
}

/// Tokens longer than three characters, deduplicated in query order.
pub(crate) fn fallback_query_entities(query: &str) -> Vec<String> {
    let mut names = Vec::new();
    for word in query.split_whitespace() {
        if word.chars().count() > 3 && !names.contains(&word.to_string()) {
            names.push(word.to_string());
        }
    }
    names
}

/// Three labeled sections: the query's entities, up to five graph paths,
/// and up to ten chunks in the speed-mode source format.
pub(crate) fn assemble_deep_context(
    chunks: &[ScoredChunk],
    documents: &HashMap<String, Document>,
    named_paths: &[Vec<String>],
    query_entities: &[String],
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !query_entities.is_empty() {
        parts.push(format!("Key Entities: {}", query_entities.join(", ")));
    }

    if !named_paths.is_empty() {
        let descriptions: Vec<String> = named_paths
            .iter()
            .take(CONTEXT_MAX_PATHS)
            .filter(|names| !names.is_empty())
            .enumerate()
            .map(|(i, names)| format!("{}. {}", i + 1, names.join(" -> ")))
            .collect();
        if !descriptions.is_empty() {
            parts.push(format!("Knowledge Graph Paths:\n{}", descriptions.join("\n")));
        }
    }

    parts.push("\nRelevant Information:".to_string());
    for sc in chunks.iter().take(CONTEXT_MAX_CHUNKS) {
        let title = documents
            .get(&sc.chunk.doc_id)
            .map(|d| d.title.as_str())
            .unwrap_or("Unknown");
        parts.push(format!("\n[Source: {}]\n{}", title, sc.chunk.content));
    }

    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;

    fn scored(id: &str, doc_id: &str, content: &str) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                id: id.to_string(),
                doc_id: doc_id.to_string(),
                chunk_index: 0,
                content: content.to_string(),
                start_char: 0,
                end_char: content.len() as i64,
                page_number: None,
            },
            score: 0.5,
        }
    }

    fn doc(id: &str, title: &str) -> Document {
        Document {
            id: id.to_string(),
            title: title.to_string(),
            doc_type: "text".to_string(),
            file_path: None,
            source_url: None,
            size_bytes: 0,
            status: "completed".to_string(),
            tags: Vec::new(),
            created_at: 0,
        }
    }

    #[test]
    fn test_fallback_entities_skip_short_tokens_and_dedup() {
        let entities = fallback_query_entities("Why does the same same word repeat so often");
        assert_eq!(entities, vec!["does", "same", "word", "repeat", "often"]);
    }

    #[test]
    fn test_fallback_entities_count_chars_not_bytes() {
        let entities = fallback_query_entities("was ist Käse");
        assert_eq!(entities, vec!["Käse"]);
    }

    #[test]
    fn test_deep_context_sections() {
        let chunks = vec![scored("c1", "d1", "Gravity bends light.")];
        let mut documents = HashMap::new();
        documents.insert("d1".to_string(), doc("d1", "Physics Notes"));
        let paths = vec![vec!["Gravity".to_string(), "Light".to_string()]];
        let entities = vec!["Gravity".to_string()];

        let context = assemble_deep_context(&chunks, &documents, &paths, &entities);
        assert!(context.starts_with("Key Entities: Gravity"));
        assert!(context.contains("Knowledge Graph Paths:\n1. Gravity -> Light"));
        assert!(context.contains("Relevant Information:"));
        assert!(context.contains("[Source: Physics Notes]\nGravity bends light."));
    }

    #[test]
    fn test_deep_context_caps_paths_and_chunks() {
        let chunks: Vec<ScoredChunk> = (0..15)
            .map(|i| scored(&format!("c{}", i), "d1", &format!("chunk {}", i)))
            .collect();
        let mut documents = HashMap::new();
        documents.insert("d1".to_string(), doc("d1", "Doc"));
        let paths: Vec<Vec<String>> = (0..8)
            .map(|i| vec![format!("N{}", i), format!("M{}", i)])
            .collect();

        let context = assemble_deep_context(&chunks, &documents, &paths, &[]);
        assert!(context.contains("5. N4 -> M4"));
        assert!(!context.contains("6. N5"));
        assert!(context.contains("chunk 9"));
        assert!(!context.contains("chunk 10"));
    }

    #[test]
    fn test_deep_context_without_graph_evidence() {
        let chunks = vec![scored("c1", "d1", "Plain fact.")];
        let mut documents = HashMap::new();
        documents.insert("d1".to_string(), doc("d1", "Doc"));

        let context = assemble_deep_context(&chunks, &documents, &[], &[]);
        assert!(!context.contains("Key Entities"));
        assert!(!context.contains("Knowledge Graph Paths"));
        assert!(context.contains("Relevant Information:"));
    }
}
