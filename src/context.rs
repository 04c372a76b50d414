//! Application context: every shared component, constructed once at startup.
//!
//! The context owns the database pool, the embedding and LM providers, the
//! vector index, the knowledge graph, and the hybrid engine, and is shared
//! behind an `Arc` by HTTP handlers and CLI commands alike. Construction is
//! explicit; there are no lazily-initialized globals.

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::engine::HybridEngine;
use crate::extract::{PlainTextExtractor, TextExtractor};
use crate::graph::KnowledgeGraph;
use crate::llm::{HttpLm, LanguageModel};
use crate::migrate;
use crate::mode::ModeSelector;
use crate::retriever_deep::DeepRetriever;
use crate::retriever_speed::SpeedRetriever;
use crate::vector_index::VectorIndex;

pub struct AppContext {
    pub config: Config,
    pub pool: SqlitePool,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub lm: Arc<dyn LanguageModel>,
    pub extractor: Arc<dyn TextExtractor>,
    pub index: Arc<VectorIndex>,
    pub graph: Arc<KnowledgeGraph>,
    pub engine: HybridEngine,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Build the context from configuration: run migrations, load index and
    /// graph snapshots if present, wire up the providers, and probe LM
    /// connectivity (logged, not fatal).
    pub async fn initialize(config: Config) -> Result<Self> {
        let lm: Arc<dyn LanguageModel> = Arc::new(HttpLm::new(
            &config.llm.base_url,
            &config.llm.model,
            config.llm.timeout_secs,
        )?);
        let embedder = embedding::create_provider(&config.embedding, &config.llm.base_url)?;
        let extractor: Arc<dyn TextExtractor> =
            Arc::new(PlainTextExtractor::new(config.llm.timeout_secs)?);

        let ctx = Self::with_providers(config, embedder, lm, extractor).await?;

        if ctx.lm.check_connection().await {
            tracing::info!(base_url = %ctx.config.llm.base_url, "LM endpoint reachable");
        } else {
            tracing::warn!(
                base_url = %ctx.config.llm.base_url,
                "LM endpoint not reachable; queries will fail until it is"
            );
        }

        Ok(ctx)
    }

    /// Build the context with explicitly injected providers. This is the
    /// seam the test suite uses to run the full pipeline offline.
    pub async fn with_providers(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        lm: Arc<dyn LanguageModel>,
        extractor: Arc<dyn TextExtractor>,
    ) -> Result<Self> {
        let pool = db::connect(&config.storage.db_path()).await?;
        migrate::run_migrations(&pool).await?;

        let index = Arc::new(VectorIndex::open(
            &config.storage.vector_index_path(),
            embedder.clone(),
        )?);
        let graph = Arc::new(KnowledgeGraph::open(&config.storage.graph_path())?);

        let selector = ModeSelector::new(lm.clone(), config.rag.mode_selection_threshold);
        let speed = SpeedRetriever::new(index.clone(), pool.clone(), config.rag.top_k_speed);
        let deep = DeepRetriever::new(
            index.clone(),
            graph.clone(),
            lm.clone(),
            pool.clone(),
            config.rag.top_k_deep,
            config.graph.max_hops,
            config.graph.max_paths,
        );
        let engine = HybridEngine::new(
            selector,
            speed,
            deep,
            lm.clone(),
            pool.clone(),
            config.llm.max_retries,
        );

        Ok(Self {
            config,
            pool,
            embedder,
            lm,
            extractor,
            index,
            graph,
            engine,
            started_at: std::time::Instant::now(),
        })
    }

    /// Persist the vector index and graph snapshots. Called after mutating
    /// operations; a snapshot failure is the caller's to handle.
    pub fn save_snapshots(&self) -> crate::error::Result<()> {
        self.index.save(&self.config.storage.vector_index_path())?;
        self.graph.save(&self.config.storage.graph_path())?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.pool.close().await;
    }
}
