//! Chunk store: durable mapping of documents, chunks, entities,
//! entity-chunk links, relations, and query provenance.
//!
//! All operations are async functions over a shared [`SqlitePool`]. Chunk
//! batch inserts are transactional; a partial batch is never visible.
//! Document deletion cascades to chunks and entity-chunk links via foreign
//! keys. Storage failure is surfaced to the caller, never swallowed.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{EngineError, Result};
use crate::models::{Chunk, DocStatus, Document, Entity, ProvenanceLog, Relation};

fn document_from_row(row: &SqliteRow) -> Document {
    let tags_json: String = row.get("tags");
    Document {
        id: row.get("id"),
        title: row.get("title"),
        doc_type: row.get("doc_type"),
        file_path: row.get("file_path"),
        source_url: row.get("source_url"),
        size_bytes: row.get("size_bytes"),
        status: row.get("status"),
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        created_at: row.get("created_at"),
    }
}

fn chunk_from_row(row: &SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        doc_id: row.get("doc_id"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        start_char: row.get("start_char"),
        end_char: row.get("end_char"),
        page_number: row.get("page_number"),
    }
}

fn entity_from_row(row: &SqliteRow) -> Entity {
    let aliases_json: String = row.get("aliases");
    Entity {
        id: row.get("id"),
        name: row.get("name"),
        entity_type: row.get("entity_type"),
        aliases: serde_json::from_str(&aliases_json).unwrap_or_default(),
    }
}

fn log_from_row(row: &SqliteRow) -> ProvenanceLog {
    let chunk_ids_json: String = row.get("chunk_ids");
    ProvenanceLog {
        id: row.get("id"),
        question: row.get("question"),
        answer: row.get("answer"),
        mode_used: row.get("mode_used"),
        confidence: row.get("confidence"),
        chunk_ids: serde_json::from_str(&chunk_ids_json).unwrap_or_default(),
        processing_time_ms: row.get("processing_time_ms"),
        session_id: row.get("session_id"),
        created_at: row.get("created_at"),
    }
}

// ============ Documents ============

pub async fn insert_document(pool: &SqlitePool, doc: &Document) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (id, title, doc_type, file_path, source_url, size_bytes, status, tags, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.title)
    .bind(&doc.doc_type)
    .bind(&doc.file_path)
    .bind(&doc.source_url)
    .bind(doc.size_bytes)
    .bind(&doc.status)
    .bind(serde_json::to_string(&doc.tags).unwrap_or_else(|_| "[]".to_string()))
    .bind(doc.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn update_document_status(
    pool: &SqlitePool,
    doc_id: &str,
    status: DocStatus,
) -> Result<()> {
    sqlx::query("UPDATE documents SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(doc_id)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn get_document(pool: &SqlitePool, doc_id: &str) -> Result<Option<Document>> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
        .bind(doc_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.as_ref().map(document_from_row))
}

pub async fn list_documents(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
    status: Option<DocStatus>,
) -> Result<Vec<Document>> {
    let rows = match status {
        Some(s) => {
            sqlx::query(
                "SELECT * FROM documents WHERE status = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
            )
            .bind(s.as_str())
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query("SELECT * FROM documents ORDER BY created_at DESC LIMIT ? OFFSET ?")
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await?
        }
    };

    Ok(rows.iter().map(document_from_row).collect())
}

/// Delete a document and everything hanging off it. Chunks and entity-chunk
/// links go via `ON DELETE CASCADE`; relation rows keep living in the graph.
/// Returns `NotFound` if the id is unknown.
pub async fn delete_document(pool: &SqlitePool, doc_id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(doc_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::NotFound(format!("document {}", doc_id)));
    }

    Ok(())
}

// ============ Chunks ============

/// Insert a chunk batch inside a single transaction. Either every chunk in
/// the batch lands or none do.
pub async fn insert_chunks(pool: &SqlitePool, chunks: &[Chunk]) -> Result<()> {
    let mut tx = pool.begin().await?;

    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, doc_id, chunk_index, content, start_char, end_char, page_number)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.doc_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.content)
        .bind(chunk.start_char)
        .bind(chunk.end_char)
        .bind(chunk.page_number)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn get_chunk(pool: &SqlitePool, chunk_id: &str) -> Result<Option<Chunk>> {
    let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
        .bind(chunk_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.as_ref().map(chunk_from_row))
}

pub async fn get_chunks_by_doc(pool: &SqlitePool, doc_id: &str) -> Result<Vec<Chunk>> {
    let rows = sqlx::query("SELECT * FROM chunks WHERE doc_id = ? ORDER BY chunk_index ASC")
        .bind(doc_id)
        .fetch_all(pool)
        .await?;

    Ok(rows.iter().map(chunk_from_row).collect())
}

// ============ Entities and links ============

pub async fn get_entity_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Entity>> {
    let row = sqlx::query("SELECT * FROM entities WHERE name = ? LIMIT 1")
        .bind(name)
        .fetch_optional(pool)
        .await?;

    Ok(row.as_ref().map(entity_from_row))
}

/// Insert an entity if `(name, entity_type)` is new; otherwise return the
/// existing row. The bool reports whether a row was created.
pub async fn upsert_entity(
    pool: &SqlitePool,
    id: &str,
    name: &str,
    entity_type: &str,
    aliases: &[String],
) -> Result<(Entity, bool)> {
    let existing = sqlx::query("SELECT * FROM entities WHERE name = ? AND entity_type = ?")
        .bind(name)
        .bind(entity_type)
        .fetch_optional(pool)
        .await?;

    if let Some(row) = existing {
        return Ok((entity_from_row(&row), false));
    }

    sqlx::query("INSERT INTO entities (id, name, entity_type, aliases) VALUES (?, ?, ?, ?)")
        .bind(id)
        .bind(name)
        .bind(entity_type)
        .bind(serde_json::to_string(aliases).unwrap_or_else(|_| "[]".to_string()))
        .execute(pool)
        .await?;

    Ok((
        Entity {
            id: id.to_string(),
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            aliases: aliases.to_vec(),
        },
        true,
    ))
}

pub async fn link_entity_chunk(pool: &SqlitePool, entity_id: &str, chunk_id: &str) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO entity_chunks (entity_id, chunk_id) VALUES (?, ?)")
        .bind(entity_id)
        .bind(chunk_id)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn insert_relation(pool: &SqlitePool, relation: &Relation) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO relations (id, source_id, target_id, label, confidence, chunk_id)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&relation.id)
    .bind(&relation.source_id)
    .bind(&relation.target_id)
    .bind(&relation.label)
    .bind(relation.confidence)
    .bind(&relation.chunk_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Names of entities mentioned in the given chunk (entity_chunks join).
pub async fn entity_names_for_chunk(pool: &SqlitePool, chunk_id: &str) -> Result<Vec<String>> {
    let rows = sqlx::query(
        r#"
        SELECT e.name FROM entities e
        JOIN entity_chunks ec ON e.id = ec.entity_id
        WHERE ec.chunk_id = ?
        ORDER BY e.name ASC
        "#,
    )
    .bind(chunk_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(|r| r.get("name")).collect())
}

/// Chunks that mention the given entity, capped at `limit`.
pub async fn chunks_for_entity(
    pool: &SqlitePool,
    entity_id: &str,
    limit: i64,
) -> Result<Vec<Chunk>> {
    let rows = sqlx::query(
        r#"
        SELECT c.* FROM chunks c
        JOIN entity_chunks ec ON c.id = ec.chunk_id
        WHERE ec.entity_id = ?
        ORDER BY c.doc_id ASC, c.chunk_index ASC
        LIMIT ?
        "#,
    )
    .bind(entity_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(chunk_from_row).collect())
}

// ============ Provenance ============

pub async fn insert_provenance_log(pool: &SqlitePool, log: &ProvenanceLog) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO provenance_logs (id, question, answer, mode_used, confidence, chunk_ids, processing_time_ms, session_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&log.id)
    .bind(&log.question)
    .bind(&log.answer)
    .bind(&log.mode_used)
    .bind(log.confidence)
    .bind(serde_json::to_string(&log.chunk_ids).unwrap_or_else(|_| "[]".to_string()))
    .bind(log.processing_time_ms)
    .bind(&log.session_id)
    .bind(log.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn query_history(
    pool: &SqlitePool,
    limit: i64,
    session_id: Option<&str>,
) -> Result<Vec<ProvenanceLog>> {
    let rows = match session_id {
        Some(sid) => {
            sqlx::query(
                "SELECT * FROM provenance_logs WHERE session_id = ? ORDER BY created_at DESC LIMIT ?",
            )
            .bind(sid)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query("SELECT * FROM provenance_logs ORDER BY created_at DESC LIMIT ?")
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
    };

    Ok(rows.iter().map(log_from_row).collect())
}

// ============ Counters (status endpoints) ============

pub async fn count_rows(pool: &SqlitePool, table: &str) -> Result<i64> {
    // Table names come from a fixed internal set, never from request input.
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Query count and average latency over the trailing hour.
pub async fn recent_query_stats(pool: &SqlitePool, now: i64) -> Result<(i64, f64)> {
    let cutoff = now - 3600;

    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM provenance_logs WHERE created_at > ?")
            .bind(cutoff)
            .fetch_one(pool)
            .await?;

    let avg: Option<f64> = sqlx::query_scalar(
        "SELECT AVG(processing_time_ms) FROM provenance_logs WHERE created_at > ?",
    )
    .bind(cutoff)
    .fetch_one(pool)
    .await?;

    Ok((count, avg.unwrap_or(0.0)))
}

/// Per-mode query counts for the metrics endpoint.
pub async fn mode_distribution(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query(
        "SELECT mode_used, COUNT(*) AS count FROM provenance_logs GROUP BY mode_used",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|r| (r.get("mode_used"), r.get("count")))
        .collect())
}

/// Per-mode average confidence for the metrics endpoint.
pub async fn confidence_by_mode(pool: &SqlitePool) -> Result<Vec<(String, f64)>> {
    let rows = sqlx::query(
        "SELECT mode_used, AVG(confidence) AS avg_confidence FROM provenance_logs GROUP BY mode_used",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|r| (r.get("mode_used"), r.get("avg_confidence")))
        .collect())
}
