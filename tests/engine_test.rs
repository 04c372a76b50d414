//! End-to-end pipeline tests: ingest → index → retrieve → answer, all
//! offline. The embedding provider is the deterministic hash backend and the
//! LM is scripted, so every assertion here is reproducible.

use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

use graph_rag::config::{load_config, Config};
use graph_rag::context::AppContext;
use graph_rag::embedding::{EmbeddingProvider, HashEmbedder};
use graph_rag::engine::QueryMode;
use graph_rag::error::EngineError;
use graph_rag::extract::PlainTextExtractor;
use graph_rag::ingest::{self, IngestRequest};
use graph_rag::llm::{Extraction, ExtractedEntity, ExtractedRelation, Intent, MockLm};
use graph_rag::models::{DocStatus, DocType, Mode};
use graph_rag::store;

const DIMS: usize = 128;

fn test_config(root: &std::path::Path) -> Config {
    let body = format!(
        r#"
[storage]
root = "{root}"

[llm]
base_url = "http://127.0.0.1:1/v1"
model = "test-model"
max_retries = 0

[embedding]
provider = "hash"
dims = {dims}

[rag]
top_k_speed = 5
top_k_deep = 10
mode_selection_threshold = 0.5
chunk_size = 1000
chunk_overlap = 100

[graph]
max_hops = 2
max_paths = 32

[server]
bind = "127.0.0.1:0"
"#,
        root = root.display(),
        dims = DIMS,
    );

    let path = root.join("grag.toml");
    fs::write(&path, body).unwrap();
    load_config(&path).unwrap()
}

async fn test_ctx(lm: MockLm) -> (TempDir, AppContext) {
    test_ctx_with_embedder(lm, Arc::new(HashEmbedder::new(DIMS))).await
}

async fn test_ctx_with_embedder(
    lm: MockLm,
    embedder: Arc<dyn EmbeddingProvider>,
) -> (TempDir, AppContext) {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());

    let ctx = AppContext::with_providers(
        config,
        embedder,
        Arc::new(lm),
        Arc::new(PlainTextExtractor::new(5).unwrap()),
    )
    .await
    .unwrap();

    (tmp, ctx)
}

async fn ingest_text(ctx: &AppContext, title: &str, content: &str) -> ingest::IngestOutcome {
    ingest::ingest_document(
        ctx,
        IngestRequest {
            file: None,
            url: None,
            content: Some(content.to_string()),
            doc_type: DocType::Text,
            title: Some(title.to_string()),
            tags: None,
        },
    )
    .await
    .unwrap()
}

fn repeated_text(sentence: &str, chars: usize) -> String {
    let mut s = sentence.repeat(chars / sentence.len() + 1);
    s.truncate(chars);
    s
}

// ============ Ingestion ============

#[tokio::test]
async fn test_ingest_ten_thousand_chars() {
    let (_tmp, ctx) = test_ctx(MockLm::new("ok")).await;

    let content = repeated_text("The solar system has eight planets orbiting the sun. ", 10_000);
    let outcome = ingest_text(&ctx, "Astronomy", &content).await;

    // Window 1000, overlap 100: starts step by 900 → 12 windows.
    assert_eq!(outcome.chunks_created, 12);
    assert_eq!(outcome.status, DocStatus::Completed);
    assert!(outcome.processing_time_ms > 0.0);

    let doc = store::get_document(&ctx.pool, &outcome.doc_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.status, "completed");

    // Store and index agree on the chunk id set.
    let chunks = store::get_chunks_by_doc(&ctx.pool, &outcome.doc_id)
        .await
        .unwrap();
    assert_eq!(chunks.len(), 12);
    assert_eq!(ctx.index.stats().total_vectors, 12);
    for chunk in &chunks {
        assert!(ctx.index.contains(&chunk.id));
    }
}

#[tokio::test]
async fn test_ingest_requires_a_source() {
    let (_tmp, ctx) = test_ctx(MockLm::new("ok")).await;

    let err = ingest::ingest_document(
        &ctx,
        IngestRequest {
            file: None,
            url: None,
            content: None,
            doc_type: DocType::Text,
            title: None,
            tags: None,
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn test_ingest_builds_knowledge_graph() {
    let lm = MockLm::new("ok").with_extraction(Extraction {
        entities: vec![
            ExtractedEntity {
                name: "Saturn".to_string(),
                entity_type: "concept".to_string(),
            },
            ExtractedEntity {
                name: "Rings".to_string(),
                entity_type: "concept".to_string(),
            },
        ],
        relations: vec![ExtractedRelation {
            source: "Saturn".to_string(),
            target: "Rings".to_string(),
            label: "has".to_string(),
            confidence: Some(0.9),
        }],
    });
    let (_tmp, ctx) = test_ctx(lm).await;

    let outcome = ingest_text(&ctx, "Saturn", "Saturn is surrounded by prominent rings.").await;
    assert_eq!(outcome.entities_extracted, 2);

    let stats = ctx.graph.stats();
    assert_eq!(stats.entity_count, 2);
    assert_eq!(stats.relation_count, 1);

    // Entity-chunk links reference live chunks.
    let entity = store::get_entity_by_name(&ctx.pool, "Saturn")
        .await
        .unwrap()
        .unwrap();
    let linked = store::chunks_for_entity(&ctx.pool, &entity.id, 10)
        .await
        .unwrap();
    assert_eq!(linked.len(), 1);
    assert!(ctx.index.contains(&linked[0].id));
}

#[tokio::test]
async fn test_entity_upsert_idempotent_relations_additive() {
    let lm = MockLm::new("ok").with_extraction(Extraction {
        entities: vec![ExtractedEntity {
            name: "Gravity".to_string(),
            entity_type: "concept".to_string(),
        }],
        relations: vec![],
    });
    let (_tmp, ctx) = test_ctx(lm).await;

    let first = ingest_text(&ctx, "Doc A", "Gravity bends spacetime.").await;
    let second = ingest_text(&ctx, "Doc B", "Gravity also bends light.").await;

    assert_eq!(first.entities_extracted, 1);
    assert_eq!(second.entities_extracted, 0);
    assert_eq!(ctx.graph.stats().entity_count, 1);
    assert_eq!(store::count_rows(&ctx.pool, "entities").await.unwrap(), 1);
}

struct FailingEmbedder;

#[async_trait::async_trait]
impl EmbeddingProvider for FailingEmbedder {
    fn model_name(&self) -> &str {
        "failing"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        Err(EngineError::Upstream("embedding backend down".to_string()))
    }
}

#[tokio::test]
async fn test_failed_ingest_marks_document_failed() {
    let (_tmp, ctx) = test_ctx_with_embedder(MockLm::new("ok"), Arc::new(FailingEmbedder)).await;

    let err = ingest::ingest_document(
        &ctx,
        IngestRequest {
            file: None,
            url: None,
            content: Some("Some content that will not embed.".to_string()),
            doc_type: DocType::Text,
            title: Some("Doomed".to_string()),
            tags: None,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::Upstream(_)));

    let failed = store::list_documents(&ctx.pool, 10, 0, Some(DocStatus::Failed))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].title, "Doomed");

    // Nothing leaked into the index.
    assert_eq!(ctx.index.stats().total_vectors, 0);
}

// ============ Chunk store laws ============

#[tokio::test]
async fn test_chunk_round_trip_preserves_order() {
    let (_tmp, ctx) = test_ctx(MockLm::new("ok")).await;

    let content = repeated_text("alpha beta gamma delta epsilon zeta. ", 3000);
    let outcome = ingest_text(&ctx, "Ordered", &content).await;

    let chunks = store::get_chunks_by_doc(&ctx.pool, &outcome.doc_id)
        .await
        .unwrap();
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i as i64);
    }
    // Spans tile the text with the configured overlap.
    for pair in chunks.windows(2) {
        assert_eq!(pair[1].start_char, pair[0].start_char + 900);
    }
}

// ============ Querying ============

#[tokio::test]
async fn test_speed_query_flow() {
    let lm = MockLm::new(
        "Saturn is the sixth planet from the sun and is famous for its spectacular ring system made of ice and rock.",
    )
    .with_intent(Intent::Factual);
    let (_tmp, ctx) = test_ctx(lm).await;

    ingest_text(
        &ctx,
        "Planets",
        "Saturn is the sixth planet from the sun. Saturn has prominent rings.",
    )
    .await;
    ingest_text(
        &ctx,
        "Moons",
        "Titan is the largest moon of Saturn. It has a dense atmosphere.",
    )
    .await;

    let outcome = ctx
        .engine
        .query("What is Saturn?", QueryMode::Auto, None, None, None)
        .await
        .unwrap();

    assert_eq!(outcome.mode_used, Mode::Speed);
    assert!(outcome.retrieval.metadata.chunks_retrieved <= 5);
    assert!(outcome.retrieval.metadata.chunks_retrieved >= 1);
    assert!(outcome.confidence >= 0.5);
    assert!((0.0..=1.0).contains(&outcome.confidence));
    assert!(outcome.processing_time_ms > 0.0);

    // Scores descend with rank and context cites the source documents.
    for pair in outcome.retrieval.chunks.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    assert!(outcome.retrieval.context.contains("[Source: "));

    // A provenance row was appended, citing only chunks that exist.
    let history = store::query_history(&ctx.pool, 10, None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].question, "What is Saturn?");
    for chunk_id in &history[0].chunk_ids {
        assert!(store::get_chunk(&ctx.pool, chunk_id).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn test_speed_query_deterministic() {
    let lm = MockLm::new("Deterministic answer about gravity and orbits in the solar system.");
    let (_tmp, ctx) = test_ctx(lm).await;

    ingest_text(&ctx, "A", "Gravity keeps planets in orbit around the sun.").await;
    ingest_text(&ctx, "B", "Orbits are elliptical, as Kepler showed.").await;

    let first = ctx
        .engine
        .query("How does gravity shape orbits?", QueryMode::Speed, None, None, None)
        .await
        .unwrap();
    let second = ctx
        .engine
        .query("How does gravity shape orbits?", QueryMode::Speed, None, None, None)
        .await
        .unwrap();

    let ids =
        |o: &graph_rag::models::QueryOutcome| -> Vec<String> {
            o.retrieval.chunks.iter().map(|c| c.chunk.id.clone()).collect()
        };
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(first.confidence, second.confidence);
}

#[tokio::test]
async fn test_auto_routes_comparative_query_to_deep() {
    let extraction = Extraction {
        entities: vec![
            ExtractedEntity {
                name: "Saturn".to_string(),
                entity_type: "concept".to_string(),
            },
            ExtractedEntity {
                name: "Jupiter".to_string(),
                entity_type: "concept".to_string(),
            },
        ],
        relations: vec![ExtractedRelation {
            source: "Saturn".to_string(),
            target: "Jupiter".to_string(),
            label: "smaller-than".to_string(),
            confidence: Some(0.8),
        }],
    };
    let lm = MockLm::new("Saturn and Jupiter are both gas giants; Jupiter is larger.")
        .with_intent(Intent::Comparative)
        .with_extraction(extraction);
    let (_tmp, ctx) = test_ctx(lm).await;

    ingest_text(
        &ctx,
        "Gas Giants",
        "Saturn and Jupiter are gas giants. Jupiter is the largest planet.",
    )
    .await;

    let outcome = ctx
        .engine
        .query(
            "Compare Saturn and Jupiter and explain why size causes different storms",
            QueryMode::Auto,
            None,
            None,
            None,
        )
        .await
        .unwrap();

    assert_eq!(outcome.mode_used, Mode::Deep);
    assert!(outcome.selection_score.unwrap() >= 0.5);
    assert_eq!(outcome.retrieval.metadata.mode, "deep");
    assert!(outcome.retrieval.metadata.graph_paths_found >= 1);
    assert!(!outcome.retrieval.query_entities.is_empty());
    assert!(outcome.retrieval.context.contains("Key Entities:"));
    assert!(outcome.retrieval.context.contains("Knowledge Graph Paths:"));
    assert!(outcome.retrieval.context.contains("Relevant Information:"));

    // Paths are simple and within the hop bound.
    for path in &outcome.retrieval.graph_paths {
        assert!(path.len() <= ctx.config.graph.max_hops + 1);
        let unique: std::collections::HashSet<_> = path.iter().collect();
        assert_eq!(unique.len(), path.len());
    }
}

#[tokio::test]
async fn test_deep_extraction_failure_falls_back_to_tokens() {
    let lm = MockLm::new("An answer synthesized without LM entity help.").failing_extraction();
    let (_tmp, ctx) = test_ctx(lm).await;

    ingest_text(&ctx, "Notes", "Photosynthesis converts sunlight into energy.").await;

    let outcome = ctx
        .engine
        .query(
            "How does photosynthesis work?",
            QueryMode::Deep,
            None,
            None,
            None,
        )
        .await
        .unwrap();

    // Tokens longer than three chars stand in for extracted entities.
    assert!(outcome
        .retrieval
        .query_entities
        .contains(&"photosynthesis".to_string()));
    assert_eq!(outcome.mode_used, Mode::Deep);
}

#[tokio::test]
async fn test_deep_with_zero_hops_finds_no_paths() {
    let lm = MockLm::new("Answer.").with_extraction(Extraction {
        entities: vec![ExtractedEntity {
            name: "Saturn".to_string(),
            entity_type: "concept".to_string(),
        }],
        relations: vec![],
    });
    let (_tmp, ctx) = test_ctx(lm).await;

    ingest_text(&ctx, "Planets", "Saturn is a gas giant with rings.").await;

    let outcome = ctx
        .engine
        .query("Tell me about Saturn", QueryMode::Deep, None, Some(0), None)
        .await
        .unwrap();

    assert_eq!(outcome.retrieval.metadata.graph_paths_found, 0);
    assert!(outcome.retrieval.graph_paths.is_empty());
    assert!(outcome.retrieval.metadata.chunks_retrieved >= 1);
}

#[tokio::test]
async fn test_empty_corpus_returns_canned_answer() {
    let (_tmp, ctx) = test_ctx(MockLm::new("should not be called")).await;

    let outcome = ctx
        .engine
        .query("Anything at all?", QueryMode::Auto, None, None, None)
        .await
        .unwrap();

    assert!(outcome.answer.starts_with("I don't have enough information"));
    assert_eq!(outcome.confidence, 0.0);
    assert!(outcome.retrieval.chunks.is_empty());
    assert!(outcome.processing_time_ms > 0.0);

    let history = store::query_history(&ctx.pool, 10, None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].chunk_ids.is_empty());
}

#[tokio::test]
async fn test_exactly_top_k_chunks_all_returned() {
    let lm = MockLm::new("All five chunks were used.");
    let (_tmp, ctx) = test_ctx(lm).await;

    // 4000 chars with window 1000 / overlap 100 → exactly 5 chunks.
    let content = repeated_text("water cycle evaporation condensation rainfall rivers ", 4000);
    let outcome = ingest_text(&ctx, "Hydrology", &content).await;
    assert_eq!(outcome.chunks_created, 5);

    let result = ctx
        .engine
        .query("water cycle", QueryMode::Speed, None, None, None)
        .await
        .unwrap();
    assert_eq!(result.retrieval.metadata.chunks_retrieved, 5);
}

#[tokio::test]
async fn test_delete_then_query_yields_canned_answer() {
    let lm = MockLm::new("Mars is the red planet.");
    let (_tmp, ctx) = test_ctx(lm).await;

    let outcome = ingest_text(&ctx, "Mars", "Mars is the red planet with two moons.").await;

    let before = ctx
        .engine
        .query("What is Mars?", QueryMode::Speed, None, None, None)
        .await
        .unwrap();
    assert!(before.retrieval.metadata.chunks_retrieved >= 1);

    ingest::delete_document(&ctx, &outcome.doc_id).await.unwrap();

    assert!(store::get_document(&ctx.pool, &outcome.doc_id)
        .await
        .unwrap()
        .is_none());
    assert!(store::get_chunks_by_doc(&ctx.pool, &outcome.doc_id)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(ctx.index.stats().total_vectors, 0);

    let after = ctx
        .engine
        .query("What is Mars?", QueryMode::Speed, None, None, None)
        .await
        .unwrap();
    assert_eq!(after.retrieval.metadata.chunks_retrieved, 0);
    assert!(after.answer.starts_with("I don't have enough information"));
    assert_eq!(after.confidence, 0.0);
}

#[tokio::test]
async fn test_delete_unknown_document_is_not_found() {
    let (_tmp, ctx) = test_ctx(MockLm::new("ok")).await;
    let err = ingest::delete_document(&ctx, "no-such-id").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

// ============ Streaming ============

#[tokio::test]
async fn test_stream_concatenation_equals_answer() {
    use futures::StreamExt;

    let answer = "Venus is the hottest planet in the solar system.";
    let lm = MockLm::new(answer).with_stream_chunks(&[
        "Venus is the hottest ",
        "planet in the ",
        "solar system.",
    ]);
    let (_tmp, ctx) = test_ctx(lm).await;

    ingest_text(&ctx, "Venus", "Venus has a thick carbon dioxide atmosphere.").await;

    let non_stream = ctx
        .engine
        .query("What is Venus?", QueryMode::Speed, None, None, None)
        .await
        .unwrap();

    let mut stream = ctx
        .engine
        .query_stream("What is Venus?", QueryMode::Speed)
        .await
        .unwrap();
    let mut streamed = String::new();
    while let Some(chunk) = stream.next().await {
        streamed.push_str(&chunk.unwrap());
    }

    assert_eq!(streamed, non_stream.answer);
}

#[tokio::test]
async fn test_stream_on_empty_corpus_yields_single_canned_chunk() {
    use futures::StreamExt;

    let (_tmp, ctx) = test_ctx(MockLm::new("unused")).await;

    let mut stream = ctx
        .engine
        .query_stream("Anything?", QueryMode::Speed)
        .await
        .unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk.unwrap());
    }
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].starts_with("I don't have enough information"));
}

// ============ History and sessions ============

#[tokio::test]
async fn test_query_history_filters_by_session() {
    let lm = MockLm::new("Some answer text.");
    let (_tmp, ctx) = test_ctx(lm).await;

    ingest_text(&ctx, "Doc", "The mitochondria is the powerhouse of the cell.").await;

    ctx.engine
        .query(
            "What is the mitochondria?",
            QueryMode::Speed,
            None,
            None,
            Some("session-a".to_string()),
        )
        .await
        .unwrap();
    ctx.engine
        .query(
            "What is the cell?",
            QueryMode::Speed,
            None,
            None,
            Some("session-b".to_string()),
        )
        .await
        .unwrap();

    let all = store::query_history(&ctx.pool, 10, None).await.unwrap();
    assert_eq!(all.len(), 2);

    let only_a = store::query_history(&ctx.pool, 10, Some("session-a"))
        .await
        .unwrap();
    assert_eq!(only_a.len(), 1);
    assert_eq!(only_a[0].question, "What is the mitochondria?");
}

// ============ Snapshots ============

#[tokio::test]
async fn test_snapshots_survive_context_restart() {
    let lm = MockLm::new("ok").with_extraction(Extraction {
        entities: vec![ExtractedEntity {
            name: "Helium".to_string(),
            entity_type: "concept".to_string(),
        }],
        relations: vec![],
    });

    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());

    let ctx = AppContext::with_providers(
        config.clone(),
        Arc::new(HashEmbedder::new(DIMS)),
        Arc::new(lm),
        Arc::new(PlainTextExtractor::new(5).unwrap()),
    )
    .await
    .unwrap();

    ingest_text(&ctx, "Gases", "Helium is lighter than air.").await;
    let vectors_before = ctx.index.stats().total_vectors;
    ctx.shutdown().await;

    let reopened = AppContext::with_providers(
        config,
        Arc::new(HashEmbedder::new(DIMS)),
        Arc::new(MockLm::new("ok")),
        Arc::new(PlainTextExtractor::new(5).unwrap()),
    )
    .await
    .unwrap();

    assert_eq!(reopened.index.stats().total_vectors, vectors_before);
    assert_eq!(reopened.graph.stats().entity_count, 1);
    // The reloaded graph still resolves the entity by name.
    assert!(reopened
        .graph
        .node_names(&[store::get_entity_by_name(&reopened.pool, "Helium")
            .await
            .unwrap()
            .unwrap()
            .id])
        .contains(&"Helium".to_string()));
}
