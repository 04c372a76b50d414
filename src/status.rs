//! System status, metrics, and health payloads.
//!
//! Backs the `/api/system/*` endpoints and the `grag status` command.
//! `cache_hit_rate` and `redis_connected` are reserved fields, always
//! `0.0` / `false`.

use serde::Serialize;

use crate::context::AppContext;
use crate::error::Result;
use crate::graph::GraphStats;
use crate::store;
use crate::vector_index::VectorIndexStats;

#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub queries_total: i64,
    pub queries_per_minute: f64,
    pub avg_latency_ms: f64,
    pub cache_hit_rate: f64,
    pub document_count: i64,
    pub chunk_count: i64,
    pub entity_count: i64,
    pub relation_count: i64,
    pub uptime_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub status: &'static str,
    pub metrics: SystemMetrics,
    pub lm_connected: bool,
    pub redis_connected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModeCount {
    pub mode: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModeConfidence {
    pub mode: String,
    pub avg_confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailedMetrics {
    pub vector_index: VectorIndexStats,
    pub knowledge_graph: GraphStats,
    pub query_distribution: Vec<ModeCount>,
    pub confidence_by_mode: Vec<ModeConfidence>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub lm_connected: bool,
    pub database: bool,
    pub timestamp: i64,
}

pub async fn system_status(ctx: &AppContext) -> Result<SystemStatus> {
    let lm_connected = ctx.lm.check_connection().await;

    let now = chrono::Utc::now().timestamp();
    let (recent_queries, avg_latency_ms) = store::recent_query_stats(&ctx.pool, now).await?;

    let metrics = SystemMetrics {
        queries_total: store::count_rows(&ctx.pool, "provenance_logs").await?,
        queries_per_minute: recent_queries as f64 / 60.0,
        avg_latency_ms,
        cache_hit_rate: 0.0,
        document_count: store::count_rows(&ctx.pool, "documents").await?,
        chunk_count: store::count_rows(&ctx.pool, "chunks").await?,
        entity_count: store::count_rows(&ctx.pool, "entities").await?,
        relation_count: store::count_rows(&ctx.pool, "relations").await?,
        uptime_seconds: ctx.started_at.elapsed().as_secs_f64(),
    };

    Ok(SystemStatus {
        status: if lm_connected { "healthy" } else { "degraded" },
        metrics,
        lm_connected,
        redis_connected: false,
    })
}

pub async fn detailed_metrics(ctx: &AppContext) -> Result<DetailedMetrics> {
    let query_distribution = store::mode_distribution(&ctx.pool)
        .await?
        .into_iter()
        .map(|(mode, count)| ModeCount { mode, count })
        .collect();

    let confidence_by_mode = store::confidence_by_mode(&ctx.pool)
        .await?
        .into_iter()
        .map(|(mode, avg_confidence)| ModeConfidence {
            mode,
            avg_confidence,
        })
        .collect();

    Ok(DetailedMetrics {
        vector_index: ctx.index.stats(),
        knowledge_graph: ctx.graph.stats(),
        query_distribution,
        confidence_by_mode,
    })
}

pub async fn health(ctx: &AppContext) -> Health {
    let lm_connected = ctx.lm.check_connection().await;
    let database = store::count_rows(&ctx.pool, "documents").await.is_ok();

    Health {
        status: if lm_connected && database {
            "healthy"
        } else {
            "degraded"
        },
        lm_connected,
        database,
        timestamp: chrono::Utc::now().timestamp(),
    }
}
