//! Ingestion pipeline orchestration.
//!
//! Coordinates the full flow for one document: validation → document row →
//! text extraction → chunking → transactional chunk storage → vector
//! indexing → entity extraction into the knowledge graph → status update →
//! snapshot saves. Any failure after the document row exists flips its
//! status to `failed` and rolls freshly added vectors back out of the index
//! best-effort, so the store and index never drift apart.

use std::time::Instant;
use uuid::Uuid;

use crate::chunker::chunk_text;
use crate::context::AppContext;
use crate::error::{EngineError, Result};
use crate::extract::IngestSource;
use crate::models::{Chunk, DocStatus, DocType, Document};
use crate::store;

/// Number of leading chunks mined for entities at ingest time. Entity
/// extraction is the slowest ingest stage; the first windows carry most of
/// a document's salient entities.
const ENTITY_EXTRACTION_CHUNKS: usize = 5;

#[derive(Debug)]
pub struct IngestRequest {
    /// Uploaded file as `(original_filename, bytes)`.
    pub file: Option<(String, Vec<u8>)>,
    pub url: Option<String>,
    pub content: Option<String>,
    pub doc_type: DocType,
    pub title: Option<String>,
    /// Comma-separated tag list.
    pub tags: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestOutcome {
    pub doc_id: String,
    pub status: DocStatus,
    pub message: String,
    pub chunks_created: usize,
    pub entities_extracted: usize,
    pub processing_time_ms: f64,
}

/// Ingest one document into the store, vector index, and knowledge graph.
pub async fn ingest_document(ctx: &AppContext, req: IngestRequest) -> Result<IngestOutcome> {
    let start = Instant::now();

    if req.file.is_none() && req.url.is_none() && req.content.is_none() {
        return Err(EngineError::InvalidInput(
            "must provide file, url, or content".to_string(),
        ));
    }

    let doc_id = Uuid::new_v4().to_string();

    let title = req.title.clone().unwrap_or_else(|| match (&req.file, &req.url) {
        (Some((filename, _)), _) => filename.clone(),
        (None, Some(url)) => url.clone(),
        _ => format!("Document {}", &doc_id[..8]),
    });

    let tags: Vec<String> = req
        .tags
        .as_deref()
        .map(|t| {
            t.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    // Persist the uploaded blob before anything can fail, so a failed
    // ingest still leaves the original bytes around for inspection.
    let mut file_path = None;
    let mut size_bytes = req.content.as_ref().map(|c| c.len() as i64).unwrap_or(0);
    if let Some((filename, bytes)) = &req.file {
        let dir = ctx.config.storage.documents_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}_{}", doc_id, filename));
        std::fs::write(&path, bytes)?;
        size_bytes = bytes.len() as i64;
        file_path = Some(path);
    }

    let document = Document {
        id: doc_id.clone(),
        title: title.clone(),
        doc_type: req.doc_type.as_str().to_string(),
        file_path: file_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned()),
        source_url: req.url.clone(),
        size_bytes,
        status: DocStatus::Processing.as_str().to_string(),
        tags,
        created_at: chrono::Utc::now().timestamp(),
    };
    store::insert_document(&ctx.pool, &document).await?;

    tracing::info!(doc_id = %doc_id, title = %title, "processing document");

    let source = if let Some(content) = req.content {
        IngestSource::Content(content)
    } else if let Some(path) = file_path {
        IngestSource::File(path)
    } else {
        IngestSource::Url(req.url.clone().unwrap_or_default())
    };

    match process(ctx, &doc_id, &source, req.doc_type).await {
        Ok((chunks_created, entities_extracted)) => {
            let processing_time_ms = start.elapsed().as_secs_f64() * 1000.0;
            tracing::info!(
                doc_id = %doc_id,
                chunks_created,
                entities_extracted,
                processing_time_ms = processing_time_ms as u64,
                "document ingested"
            );
            Ok(IngestOutcome {
                doc_id,
                status: DocStatus::Completed,
                message: format!("Document '{}' ingested successfully", title),
                chunks_created,
                entities_extracted,
                processing_time_ms,
            })
        }
        Err(e) => {
            tracing::error!(doc_id = %doc_id, error = %e, "ingestion failed");

            // Best-effort rollback: mark the document failed and drop any
            // vectors that made it into the index before the failure.
            if let Err(status_err) =
                store::update_document_status(&ctx.pool, &doc_id, DocStatus::Failed).await
            {
                tracing::warn!(doc_id = %doc_id, error = %status_err, "failed to mark document failed");
            }
            if let Ok(chunks) = store::get_chunks_by_doc(&ctx.pool, &doc_id).await {
                let ids: Vec<String> = chunks.into_iter().map(|c| c.id).collect();
                ctx.index.remove_chunks(&ids);
            }

            Err(e)
        }
    }
}

/// The failable part of the pipeline; runs after the document row exists.
async fn process(
    ctx: &AppContext,
    doc_id: &str,
    source: &IngestSource,
    doc_type: DocType,
) -> Result<(usize, usize)> {
    let text = ctx.extractor.extract(source, doc_type).await?;

    let chunks = chunk_text(
        doc_id,
        &text,
        ctx.config.rag.chunk_size,
        ctx.config.rag.chunk_overlap,
    );
    if chunks.is_empty() {
        return Err(EngineError::InvalidInput(
            "document contained no extractable text".to_string(),
        ));
    }

    store::insert_chunks(&ctx.pool, &chunks).await?;

    let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
    let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
    ctx.index.add_chunks(&ids, &texts).await?;

    let entities_extracted = extract_entities(ctx, doc_id, &chunks).await;

    store::update_document_status(&ctx.pool, doc_id, DocStatus::Completed).await?;
    ctx.save_snapshots()?;

    Ok((chunks.len(), entities_extracted))
}

/// Mine the leading chunks for entities and relations. A per-chunk LM
/// failure degrades the document's graph coverage but does not fail the
/// ingest.
async fn extract_entities(ctx: &AppContext, doc_id: &str, chunks: &[Chunk]) -> usize {
    let mut total = 0usize;

    for chunk in chunks.iter().take(ENTITY_EXTRACTION_CHUNKS) {
        match ctx
            .graph
            .extract_and_add(ctx.lm.as_ref(), &ctx.pool, &chunk.content, doc_id, &chunk.id)
            .await
        {
            Ok((entities, _relations)) => total += entities,
            Err(e) => {
                tracing::warn!(doc_id = %doc_id, chunk_id = %chunk.id, error = %e, "entity extraction failed for chunk");
            }
        }
    }

    total
}

/// Delete a document everywhere: vector index first, then the cascading
/// database delete. Returns `NotFound` for unknown ids.
pub async fn delete_document(ctx: &AppContext, doc_id: &str) -> Result<()> {
    let Some(_doc) = store::get_document(&ctx.pool, doc_id).await? else {
        return Err(EngineError::NotFound(format!("document {}", doc_id)));
    };

    let chunks = store::get_chunks_by_doc(&ctx.pool, doc_id).await?;
    let ids: Vec<String> = chunks.into_iter().map(|c| c.id).collect();
    ctx.index.remove_chunks(&ids);

    store::delete_document(&ctx.pool, doc_id).await?;

    if let Err(e) = ctx.save_snapshots() {
        tracing::warn!(doc_id = %doc_id, error = %e, "failed to save snapshots after delete");
    }

    tracing::info!(doc_id = %doc_id, "document deleted");
    Ok(())
}
