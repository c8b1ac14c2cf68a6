//! PostgreSQL implementation of [`StorageAdapter`].
//!
//! Uses a plain `REAL[]` column for embeddings and a generated `tsvector`
//! for keyword search, so the server needs no extensions. The queue claims
//! rows with `FOR UPDATE SKIP LOCKED`.
//!
//! `index_type`, `hnsw_m`, `ef_construction` and `ivf_lists` are validated and
//! recorded in the database metadata; semantic search currently scans every
//! embedded chunk like the SQLite store does.

use super::options::{BackendKind, PostgresIndexType, PostgresOptions};
use super::sql::{push_path_filters, search_terms};
use super::{
    Chunk, ChunkId, Document, DocumentFilter, DocumentId, DocumentPatch, DocumentStatus, DocumentStatusCounts,
    EmbeddingUpdate, MatchType, NewChunk, NewDocument, OcrStatus, PendingChunk, QueueItem, QueueItemId,
    QueueItemPatch, QueueItemStatus, QueuePriority, QueueStatus, RawHit, SearchFilters, StorageAdapter,
    StorageStats, TagCount, check_dimensions, check_limit, from_millis, normalize_extension, to_millis,
};
use crate::error::{DbContext, Error, Result};
use crate::vector;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Postgres, QueryBuilder, Row, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

const BACKEND: BackendKind = BackendKind::Postgres;

const DEFAULT_MAX_QUEUE_DEPTH: usize = 10_000;

const DOCUMENT_COLUMNS: &str = "id, file_path, file_name, file_extension, file_size, file_hash, mime_type, \
     file_modified_at, status, ocr_status, title, created_at, updated_at";

const CHUNK_COLUMNS: &str =
    "id, document_id, chunk_index, text, start_offset, end_offset, page, section, embedding, created_at";

const QUEUE_COLUMNS: &str =
    "id, file_path, priority, status, attempts, error, created_at, updated_at, started_at, completed_at";

const HIT_COLUMNS: &str = "c.id AS chunk_id, c.document_id, d.file_path, d.file_name, c.chunk_index, \
     c.text, c.page, c.section, c.embedding";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id BIGSERIAL PRIMARY KEY,
        file_path TEXT NOT NULL UNIQUE,
        file_name TEXT NOT NULL,
        file_extension TEXT NOT NULL DEFAULT '',
        file_size BIGINT NOT NULL DEFAULT 0,
        file_hash TEXT NOT NULL,
        mime_type TEXT,
        file_modified_at BIGINT,
        status TEXT NOT NULL DEFAULT 'pending',
        ocr_status TEXT NOT NULL DEFAULT 'not_needed',
        title TEXT,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)",
    "CREATE INDEX IF NOT EXISTS idx_documents_modified ON documents(file_modified_at)",
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id BIGSERIAL PRIMARY KEY,
        document_id BIGINT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        chunk_index BIGINT NOT NULL,
        text TEXT NOT NULL,
        start_offset BIGINT NOT NULL DEFAULT 0,
        end_offset BIGINT NOT NULL DEFAULT 0,
        page BIGINT,
        section TEXT,
        embedding REAL[],
        search_vector TSVECTOR GENERATED ALWAYS AS (to_tsvector('simple', text)) STORED,
        created_at BIGINT NOT NULL,
        UNIQUE(document_id, chunk_index)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id, chunk_index)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_search ON chunks USING GIN(search_vector)",
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS document_tags (
        document_id BIGINT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        tag_id BIGINT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
        PRIMARY KEY (document_id, tag_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue_items (
        id BIGSERIAL PRIMARY KEY,
        file_path TEXT NOT NULL,
        priority BIGINT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts BIGINT NOT NULL DEFAULT 0,
        error TEXT,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        started_at BIGINT,
        completed_at BIGINT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_queue_claim ON queue_items(status, priority DESC, created_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_queue_path ON queue_items(file_path)",
    r#"
    CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at BIGINT NOT NULL
    )
    "#,
];

/// Postgres-backed storage reached through a connection URL.
pub struct PostgresStore {
    url: String,
    options: PostgresOptions,
    dimensions: usize,
    max_queue_depth: usize,
    pool: RwLock<Option<PgPool>>,
    ready: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
}

impl PostgresStore {
    pub fn new(url: impl Into<String>, options: PostgresOptions, dimensions: usize) -> Self {
        Self {
            url: url.into(),
            options,
            dimensions,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            pool: RwLock::new(None),
            ready: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_max_queue_depth(self, max_queue_depth: usize) -> Self {
        Self {
            max_queue_depth,
            ..self
        }
    }

    pub fn options(&self) -> &PostgresOptions {
        &self.options
    }

    fn pool(&self) -> Result<PgPool> {
        if !self.is_ready() {
            return Err(Error::NotInitialized { backend: BACKEND });
        }
        self.pool
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(Error::NotInitialized { backend: BACKEND })
    }

    async fn require_document(&self, pool: &PgPool, id: DocumentId) -> Result<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM documents WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .db_context(BACKEND, "get_document")?;
        match exists {
            Some(_) => Ok(()),
            None => Err(Error::not_found(format!("document {id}"))),
        }
    }
}

fn push_document_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &DocumentFilter) {
    push_path_filters(qb, &filter.folders, &filter.file_extensions);
    if let Some(status) = filter.status {
        qb.push(" AND d.status = ").push_bind(status.as_str());
    }
}

fn decode<T>(result: std::result::Result<T, sqlx::Error>) -> Result<T> {
    result.db_context(BACKEND, "decode row")
}

fn document_from_row(row: &PgRow) -> Result<Document> {
    let status: String = decode(row.try_get("status"))?;
    let ocr_status: String = decode(row.try_get("ocr_status"))?;
    let modified: Option<i64> = decode(row.try_get("file_modified_at"))?;
    Ok(Document {
        id: decode(row.try_get("id"))?,
        file_path: decode(row.try_get("file_path"))?,
        file_name: decode(row.try_get("file_name"))?,
        file_extension: decode(row.try_get("file_extension"))?,
        file_size: decode(row.try_get("file_size"))?,
        file_hash: decode(row.try_get("file_hash"))?,
        mime_type: decode(row.try_get("mime_type"))?,
        file_modified_at: modified.map(from_millis),
        status: DocumentStatus::from_str(&status)?,
        ocr_status: OcrStatus::from_str(&ocr_status)?,
        title: decode(row.try_get("title"))?,
        created_at: from_millis(decode(row.try_get("created_at"))?),
        updated_at: from_millis(decode(row.try_get("updated_at"))?),
    })
}

fn chunk_from_row(row: &PgRow) -> Result<Chunk> {
    Ok(Chunk {
        id: decode(row.try_get("id"))?,
        document_id: decode(row.try_get("document_id"))?,
        chunk_index: decode(row.try_get("chunk_index"))?,
        text: decode(row.try_get("text"))?,
        start_offset: decode(row.try_get("start_offset"))?,
        end_offset: decode(row.try_get("end_offset"))?,
        page: decode(row.try_get("page"))?,
        section: decode(row.try_get("section"))?,
        embedding: decode(row.try_get("embedding"))?,
        created_at: from_millis(decode(row.try_get("created_at"))?),
    })
}

fn queue_item_from_row(row: &PgRow) -> Result<QueueItem> {
    let status: String = decode(row.try_get("status"))?;
    let started: Option<i64> = decode(row.try_get("started_at"))?;
    let completed: Option<i64> = decode(row.try_get("completed_at"))?;
    Ok(QueueItem {
        id: decode(row.try_get("id"))?,
        file_path: decode(row.try_get("file_path"))?,
        priority: QueuePriority::from_rank(decode(row.try_get("priority"))?)?,
        status: QueueItemStatus::from_str(&status)?,
        attempts: decode(row.try_get("attempts"))?,
        error: decode(row.try_get("error"))?,
        created_at: from_millis(decode(row.try_get("created_at"))?),
        updated_at: from_millis(decode(row.try_get("updated_at"))?),
        started_at: started.map(from_millis),
        completed_at: completed.map(from_millis),
    })
}

fn hit_from_row(row: &PgRow, score: f32, match_type: MatchType, highlights: Vec<String>) -> Result<RawHit> {
    Ok(RawHit {
        chunk_id: decode(row.try_get("chunk_id"))?,
        document_id: decode(row.try_get("document_id"))?,
        file_path: decode(row.try_get("file_path"))?,
        file_name: decode(row.try_get("file_name"))?,
        chunk_index: decode(row.try_get("chunk_index"))?,
        text: decode(row.try_get("text"))?,
        score,
        match_type,
        highlights,
        page: decode(row.try_get("page"))?,
        section: decode(row.try_get("section"))?,
        embedding: decode(row.try_get("embedding"))?,
    })
}

fn bind_json<'q>(
    mut query: sqlx::query::Query<'q, Postgres, PgArguments>,
    params: &[serde_json::Value],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    use serde_json::Value;
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

fn row_to_json(row: &PgRow) -> Result<serde_json::Map<String, serde_json::Value>> {
    use serde_json::Value;
    let mut map = serde_json::Map::new();
    for column in row.columns() {
        let index = column.ordinal();
        let is_null = decode(row.try_get_raw(index))?.is_null();
        let value = if is_null {
            Value::Null
        } else {
            match column.type_info().name() {
                "INT2" => Value::from(decode(row.try_get::<i16, _>(index))?),
                "INT4" => Value::from(decode(row.try_get::<i32, _>(index))?),
                "INT8" => Value::from(decode(row.try_get::<i64, _>(index))?),
                "FLOAT4" => Value::from(decode(row.try_get::<f32, _>(index))?),
                "FLOAT8" => Value::from(decode(row.try_get::<f64, _>(index))?),
                "BOOL" => Value::from(decode(row.try_get::<bool, _>(index))?),
                "FLOAT4[]" => Value::from(decode(row.try_get::<Vec<f32>, _>(index))?),
                "BYTEA" => Value::from(decode(row.try_get::<Vec<u8>, _>(index))?),
                other => match row.try_get::<String, _>(index) {
                    Ok(text) => Value::from(text),
                    Err(_) => {
                        debug!("Column {} has unsupported type {other}", column.name());
                        Value::Null
                    }
                },
            }
        };
        map.insert(column.name().to_string(), value);
    }
    Ok(map)
}

#[async_trait]
impl StorageAdapter for PostgresStore {
    fn backend(&self) -> BackendKind {
        BACKEND
    }

    fn embedding_dimensions(&self) -> usize {
        self.dimensions
    }

    async fn initialize(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.is_ready() {
            return Ok(());
        }

        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(&self.url)
            .await
            .db_context(BACKEND, "open")?;
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .db_context(BACKEND, "create schema")?;
        }
        if self.options.index_type != PostgresIndexType::None {
            debug!(
                "Postgres {} index settings recorded; semantic search scans embedded chunks",
                self.options.index_type.as_str()
            );
        }
        info!("Opened Postgres store");

        *self.pool.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(pool);
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        self.ready.store(false, Ordering::SeqCst);
        let pool = self
            .pool
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(pool) = pool {
            pool.close().await;
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn create_document(&self, document: NewDocument) -> Result<Document> {
        let pool = self.pool()?;
        if document.file_path.trim().is_empty() {
            return Err(Error::invalid_input("document file_path must not be empty"));
        }
        let now = to_millis(Utc::now());
        let sql = format!(
            "INSERT INTO documents (file_path, file_name, file_extension, file_size, file_hash, mime_type, \
             file_modified_at, status, ocr_status, title, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11) RETURNING {DOCUMENT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&document.file_path)
            .bind(&document.file_name)
            .bind(normalize_extension(&document.file_extension))
            .bind(document.file_size)
            .bind(&document.file_hash)
            .bind(&document.mime_type)
            .bind(document.file_modified_at.map(to_millis))
            .bind(document.status.unwrap_or(DocumentStatus::Pending).as_str())
            .bind(document.ocr_status.unwrap_or(OcrStatus::NotNeeded).as_str())
            .bind(&document.title)
            .bind(now)
            .fetch_one(&pool)
            .await;

        match row {
            Ok(row) => document_from_row(&row),
            Err(e) if e.as_database_error().is_some_and(|d| d.is_unique_violation()) => Err(Error::conflict(
                format!("a document already exists at {}", document.file_path),
            )),
            Err(e) => Err(e).db_context(BACKEND, "create_document"),
        }
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>> {
        let pool = self.pool()?;
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&pool)
            .await
            .db_context(BACKEND, "get_document")?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn get_document_by_path(&self, file_path: &str) -> Result<Option<Document>> {
        let pool = self.pool()?;
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE file_path = $1");
        let row = sqlx::query(&sql)
            .bind(file_path)
            .fetch_optional(&pool)
            .await
            .db_context(BACKEND, "get_document_by_path")?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn update_document(&self, id: DocumentId, patch: DocumentPatch) -> Result<Option<Document>> {
        let pool = self.pool()?;
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE documents SET updated_at = ");
        qb.push_bind(to_millis(Utc::now()));
        if let Some(size) = patch.file_size {
            qb.push(", file_size = ").push_bind(size);
        }
        if let Some(hash) = patch.file_hash {
            qb.push(", file_hash = ").push_bind(hash);
        }
        if let Some(mime) = patch.mime_type {
            qb.push(", mime_type = ").push_bind(mime);
        }
        if let Some(modified) = patch.file_modified_at {
            qb.push(", file_modified_at = ").push_bind(to_millis(modified));
        }
        if let Some(status) = patch.status {
            qb.push(", status = ").push_bind(status.as_str());
        }
        if let Some(ocr) = patch.ocr_status {
            qb.push(", ocr_status = ").push_bind(ocr.as_str());
        }
        if let Some(title) = patch.title {
            qb.push(", title = ").push_bind(title);
        }
        qb.push(" WHERE id = ").push_bind(id);
        qb.push(" RETURNING ").push(DOCUMENT_COLUMNS);

        let row = qb
            .build()
            .fetch_optional(&pool)
            .await
            .db_context(BACKEND, "update_document")?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn delete_document(&self, id: DocumentId) -> Result<bool> {
        let pool = self.pool()?;
        let result = sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(id)
            .execute(&pool)
            .await
            .db_context(BACKEND, "delete_document")?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>> {
        let pool = self.pool()?;
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT {DOCUMENT_COLUMNS} FROM documents d WHERE 1 = 1"));
        push_document_filter(&mut qb, filter);
        qb.push(" ORDER BY d.file_path");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
        qb.push(" OFFSET ").push_bind(filter.offset as i64);

        let rows = qb
            .build()
            .fetch_all(&pool)
            .await
            .db_context(BACKEND, "list_documents")?;
        rows.iter().map(document_from_row).collect()
    }

    async fn count_documents(&self, filter: &DocumentFilter) -> Result<i64> {
        let pool = self.pool()?;
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM documents d WHERE 1 = 1");
        push_document_filter(&mut qb, filter);
        qb.build_query_scalar::<i64>()
            .fetch_one(&pool)
            .await
            .db_context(BACKEND, "count_documents")
    }

    async fn create_chunks(&self, document_id: DocumentId, chunks: Vec<NewChunk>) -> Result<Vec<ChunkId>> {
        let pool = self.pool()?;
        for chunk in &chunks {
            if let Some(embedding) = &chunk.embedding {
                check_dimensions(self.dimensions, embedding)?;
            }
        }
        self.require_document(&pool, document_id).await?;

        let now = to_millis(Utc::now());
        let mut tx = pool.begin().await.db_context(BACKEND, "create_chunks")?;
        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO chunks (document_id, chunk_index, text, start_offset, end_offset, page, section, \
                 embedding, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING id",
            )
            .bind(document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(chunk.start_offset)
            .bind(chunk.end_offset)
            .bind(chunk.page)
            .bind(&chunk.section)
            .bind(&chunk.embedding)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .db_context(BACKEND, "create_chunks")?;
            ids.push(id);
        }
        tx.commit().await.db_context(BACKEND, "create_chunks")?;
        Ok(ids)
    }

    async fn get_chunks(&self, document_id: DocumentId) -> Result<Vec<Chunk>> {
        let pool = self.pool()?;
        let sql = format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE document_id = $1 ORDER BY chunk_index");
        let rows = sqlx::query(&sql)
            .bind(document_id)
            .fetch_all(&pool)
            .await
            .db_context(BACKEND, "get_chunks")?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn delete_chunks(&self, document_id: DocumentId) -> Result<u64> {
        let pool = self.pool()?;
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = $1")
            .bind(document_id)
            .execute(&pool)
            .await
            .db_context(BACKEND, "delete_chunks")?;
        Ok(result.rows_affected())
    }

    async fn update_embeddings(&self, updates: &[EmbeddingUpdate]) -> Result<()> {
        let pool = self.pool()?;
        for update in updates {
            check_dimensions(self.dimensions, &update.embedding)?;
        }

        let mut tx = pool.begin().await.db_context(BACKEND, "update_embeddings")?;
        for update in updates {
            let result = sqlx::query("UPDATE chunks SET embedding = $1 WHERE id = $2")
                .bind(&update.embedding)
                .bind(update.chunk_id)
                .execute(&mut *tx)
                .await
                .db_context(BACKEND, "update_embeddings")?;
            if result.rows_affected() == 0 {
                debug!("Skipping embedding for missing chunk {}", update.chunk_id);
            }
        }
        tx.commit().await.db_context(BACKEND, "update_embeddings")
    }

    async fn count_chunks(&self, document_id: Option<DocumentId>) -> Result<i64> {
        let pool = self.pool()?;
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE $1::BIGINT IS NULL OR document_id = $1")
            .bind(document_id)
            .fetch_one(&pool)
            .await
            .db_context(BACKEND, "count_chunks")
    }

    async fn chunks_without_embeddings(&self, limit: usize) -> Result<Vec<PendingChunk>> {
        check_limit(limit)?;
        let pool = self.pool()?;
        let rows = sqlx::query("SELECT id, document_id, text FROM chunks WHERE embedding IS NULL ORDER BY id LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&pool)
            .await
            .db_context(BACKEND, "chunks_without_embeddings")?;
        rows.iter()
            .map(|row| {
                Ok(PendingChunk {
                    chunk_id: decode(row.try_get("id"))?,
                    document_id: decode(row.try_get("document_id"))?,
                    text: decode(row.try_get("text"))?,
                })
            })
            .collect()
    }

    async fn add_tags(&self, document_id: DocumentId, tags: &[String]) -> Result<()> {
        let pool = self.pool()?;
        self.require_document(&pool, document_id).await?;

        let mut tx = pool.begin().await.db_context(BACKEND, "add_tags")?;
        for tag in tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            sqlx::query("INSERT INTO tags (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
                .bind(tag)
                .execute(&mut *tx)
                .await
                .db_context(BACKEND, "add_tags")?;
            sqlx::query(
                "INSERT INTO document_tags (document_id, tag_id) SELECT $1, id FROM tags WHERE name = $2 \
                 ON CONFLICT DO NOTHING",
            )
            .bind(document_id)
            .bind(tag)
            .execute(&mut *tx)
            .await
            .db_context(BACKEND, "add_tags")?;
        }
        tx.commit().await.db_context(BACKEND, "add_tags")
    }

    async fn remove_tags(&self, document_id: DocumentId, tags: &[String]) -> Result<()> {
        let pool = self.pool()?;
        let names: Vec<String> = tags.iter().map(|t| t.trim().to_string()).collect();
        sqlx::query(
            "DELETE FROM document_tags WHERE document_id = $1 \
             AND tag_id IN (SELECT id FROM tags WHERE name = ANY($2))",
        )
        .bind(document_id)
        .bind(names)
        .execute(&pool)
        .await
        .db_context(BACKEND, "remove_tags")?;
        Ok(())
    }

    async fn get_tags(&self, document_id: DocumentId) -> Result<Vec<String>> {
        let pool = self.pool()?;
        sqlx::query_scalar(
            "SELECT t.name FROM tags t JOIN document_tags dt ON dt.tag_id = t.id \
             WHERE dt.document_id = $1 ORDER BY t.name",
        )
        .bind(document_id)
        .fetch_all(&pool)
        .await
        .db_context(BACKEND, "get_tags")
    }

    async fn get_all_tags(&self) -> Result<Vec<TagCount>> {
        let pool = self.pool()?;
        let rows = sqlx::query(
            "SELECT t.name AS tag, COUNT(dt.document_id) AS count FROM tags t \
             JOIN document_tags dt ON dt.tag_id = t.id GROUP BY t.id, t.name ORDER BY count DESC, t.name",
        )
        .fetch_all(&pool)
        .await
        .db_context(BACKEND, "get_all_tags")?;
        rows.iter()
            .map(|row| {
                Ok(TagCount {
                    tag: decode(row.try_get("tag"))?,
                    count: decode(row.try_get("count"))?,
                })
            })
            .collect()
    }

    async fn enqueue(&self, file_path: &str, priority: Option<QueuePriority>) -> Result<QueueItem> {
        let pool = self.pool()?;
        let priority = priority.unwrap_or_default();
        let now = to_millis(Utc::now());
        let mut tx = pool.begin().await.db_context(BACKEND, "enqueue")?;

        // A path that is already waiting keeps its place; a higher priority still applies.
        let sql = format!(
            "UPDATE queue_items SET priority = GREATEST(priority, $1), updated_at = $2 \
             WHERE id = (SELECT id FROM queue_items WHERE file_path = $3 AND status = 'pending' \
                         LIMIT 1 FOR UPDATE) \
             RETURNING {QUEUE_COLUMNS}"
        );
        let existing = sqlx::query(&sql)
            .bind(priority.rank())
            .bind(now)
            .bind(file_path)
            .fetch_optional(&mut *tx)
            .await
            .db_context(BACKEND, "enqueue")?;
        if let Some(row) = existing {
            tx.commit().await.db_context(BACKEND, "enqueue")?;
            return queue_item_from_row(&row);
        }

        let depth: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM queue_items WHERE status IN ('pending', 'processing')")
                .fetch_one(&mut *tx)
                .await
                .db_context(BACKEND, "enqueue")?;
        if depth >= self.max_queue_depth as i64 {
            return Err(Error::invalid_input(format!(
                "indexing queue is full ({depth} of {} items waiting)",
                self.max_queue_depth
            )));
        }

        let sql = format!(
            "INSERT INTO queue_items (file_path, priority, status, created_at, updated_at) \
             VALUES ($1, $2, 'pending', $3, $3) RETURNING {QUEUE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(file_path)
            .bind(priority.rank())
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .db_context(BACKEND, "enqueue")?;
        tx.commit().await.db_context(BACKEND, "enqueue")?;
        queue_item_from_row(&row)
    }

    async fn dequeue(&self) -> Result<Option<QueueItem>> {
        let pool = self.pool()?;
        let sql = format!(
            "UPDATE queue_items SET status = 'processing', started_at = $1, updated_at = $1, \
             attempts = attempts + 1 \
             WHERE id = (SELECT id FROM queue_items WHERE status = 'pending' \
                         ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1 \
                         FOR UPDATE SKIP LOCKED) \
             RETURNING {QUEUE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(to_millis(Utc::now()))
            .fetch_optional(&pool)
            .await
            .db_context(BACKEND, "dequeue")?;
        row.as_ref().map(queue_item_from_row).transpose()
    }

    async fn update_queue_item(&self, id: QueueItemId, patch: QueueItemPatch) -> Result<Option<QueueItem>> {
        let pool = self.pool()?;
        let now = Utc::now();
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE queue_items SET updated_at = ");
        qb.push_bind(to_millis(now));
        if let Some(status) = patch.status {
            qb.push(", status = ").push_bind(status.as_str());
            let completed_at = patch.completed_at.or(status.is_terminal().then_some(now));
            if let Some(at) = completed_at {
                qb.push(", completed_at = ").push_bind(to_millis(at));
            }
        } else if let Some(at) = patch.completed_at {
            qb.push(", completed_at = ").push_bind(to_millis(at));
        }
        if let Some(priority) = patch.priority {
            qb.push(", priority = ").push_bind(priority.rank());
        }
        if let Some(error) = patch.error {
            qb.push(", error = ").push_bind(error);
        }
        qb.push(" WHERE id = ").push_bind(id);
        qb.push(" RETURNING ").push(QUEUE_COLUMNS);

        let row = qb
            .build()
            .fetch_optional(&pool)
            .await
            .db_context(BACKEND, "update_queue_item")?;
        row.as_ref().map(queue_item_from_row).transpose()
    }

    async fn queue_status(&self) -> Result<QueueStatus> {
        let pool = self.pool()?;
        let rows: Vec<(String, i64, i64)> =
            sqlx::query_as("SELECT status, priority, COUNT(*) FROM queue_items GROUP BY status, priority")
                .fetch_all(&pool)
                .await
                .db_context(BACKEND, "queue_status")?;

        let mut status = QueueStatus::default();
        for (state, rank, n) in rows {
            status.total += n;
            match QueueItemStatus::from_str(&state)? {
                QueueItemStatus::Pending => {
                    status.pending += n;
                    match QueuePriority::from_rank(rank)? {
                        QueuePriority::Low => status.by_priority.low += n,
                        QueuePriority::Normal => status.by_priority.normal += n,
                        QueuePriority::High => status.by_priority.high += n,
                    }
                }
                QueueItemStatus::Processing => status.processing += n,
                QueueItemStatus::Completed => status.completed += n,
                QueueItemStatus::Failed => status.failed += n,
            }
        }
        Ok(status)
    }

    async fn clear_completed(&self) -> Result<u64> {
        let pool = self.pool()?;
        let result = sqlx::query("DELETE FROM queue_items WHERE status = 'completed'")
            .execute(&pool)
            .await
            .db_context(BACKEND, "clear_completed")?;
        Ok(result.rows_affected())
    }

    async fn clear_queue(&self) -> Result<u64> {
        let pool = self.pool()?;
        let result = sqlx::query("DELETE FROM queue_items")
            .execute(&pool)
            .await
            .db_context(BACKEND, "clear_queue")?;
        Ok(result.rows_affected())
    }

    async fn search_keyword(&self, query: &str, filters: &SearchFilters, limit: usize) -> Result<Vec<RawHit>> {
        check_limit(limit)?;
        let pool = self.pool()?;
        let terms = search_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let tsquery = terms.join(" | ");

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {HIT_COLUMNS}, ts_rank(c.search_vector, q.query) AS rank, \
             ts_headline('simple', c.text, q.query, \
                 'StartSel=<mark>, StopSel=</mark>, MaxWords=24, MinWords=8') AS highlight \
             FROM chunks c JOIN documents d ON d.id = c.document_id, \
             to_tsquery('simple', "
        ));
        qb.push_bind(tsquery);
        qb.push(") AS q(query) WHERE c.search_vector @@ q.query");
        push_path_filters(&mut qb, &filters.folders, &filters.normalized_types());
        qb.push(" ORDER BY rank DESC, c.id LIMIT ").push_bind(limit as i64);

        let rows = qb
            .build()
            .fetch_all(&pool)
            .await
            .db_context(BACKEND, "search_keyword")?;
        rows.iter()
            .map(|row| {
                let rank: f32 = decode(row.try_get("rank"))?;
                let highlight: Option<String> = decode(row.try_get("highlight"))?;
                let highlights = highlight.filter(|h| !h.is_empty()).into_iter().collect();
                hit_from_row(row, rank, MatchType::Keyword, highlights)
            })
            .collect()
    }

    async fn search_semantic(&self, vector: &[f32], filters: &SearchFilters, limit: usize) -> Result<Vec<RawHit>> {
        check_limit(limit)?;
        check_dimensions(self.dimensions, vector)?;
        let pool = self.pool()?;

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {HIT_COLUMNS} FROM chunks c JOIN documents d ON d.id = c.document_id \
             WHERE c.embedding IS NOT NULL"
        ));
        push_path_filters(&mut qb, &filters.folders, &filters.normalized_types());

        let metric = self.options.distance_metric;
        let mut hits = Vec::new();
        let mut rows = qb.build().fetch(&pool);
        while let Some(row) = rows.try_next().await.db_context(BACKEND, "search_semantic")? {
            let mut hit = hit_from_row(&row, 0.0, MatchType::Semantic, Vec::new())?;
            match hit.embedding.as_deref() {
                Some(embedding) if embedding.len() == vector.len() => {
                    hit.score = vector::similarity(metric, vector, embedding);
                    hits.push(hit);
                }
                _ => warn!("Chunk {} has an unreadable embedding, skipping", hit.chunk_id),
            }
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn file_hashes(&self) -> Result<HashMap<String, String>> {
        let pool = self.pool()?;
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT file_path, file_hash FROM documents")
            .fetch_all(&pool)
            .await
            .db_context(BACKEND, "file_hashes")?;
        Ok(rows.into_iter().collect())
    }

    async fn documents_modified_since(&self, since: DateTime<Utc>) -> Result<Vec<Document>> {
        let pool = self.pool()?;
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents \
             WHERE updated_at >= $1 OR file_modified_at >= $1 ORDER BY updated_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(to_millis(since))
            .fetch_all(&pool)
            .await
            .db_context(BACKEND, "documents_modified_since")?;
        rows.iter().map(document_from_row).collect()
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let pool = self.pool()?;
        sqlx::query_scalar("SELECT value FROM config WHERE key = $1")
            .bind(key)
            .fetch_optional(&pool)
            .await
            .db_context(BACKEND, "get_config")
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let pool = self.pool()?;
        sqlx::query(
            "INSERT INTO config (key, value, updated_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(to_millis(Utc::now()))
        .execute(&pool)
        .await
        .db_context(BACKEND, "set_config")?;
        Ok(())
    }

    async fn delete_config(&self, key: &str) -> Result<bool> {
        let pool = self.pool()?;
        let result = sqlx::query("DELETE FROM config WHERE key = $1")
            .bind(key)
            .execute(&pool)
            .await
            .db_context(BACKEND, "delete_config")?;
        Ok(result.rows_affected() > 0)
    }

    async fn raw_query(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>> {
        let pool = self.pool()?;
        let rows = bind_json(sqlx::query(sql), params)
            .fetch_all(&pool)
            .await
            .db_context(BACKEND, "raw_query")?;
        rows.iter().map(row_to_json).collect()
    }

    async fn raw_execute(&self, sql: &str, params: &[serde_json::Value]) -> Result<u64> {
        let pool = self.pool()?;
        let result = bind_json(sqlx::query(sql), params)
            .execute(&pool)
            .await
            .db_context(BACKEND, "raw_execute")?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<StorageStats> {
        let pool = self.pool()?;
        let by_status: Vec<(String, i64)> = sqlx::query_as("SELECT status, COUNT(*) FROM documents GROUP BY status")
            .fetch_all(&pool)
            .await
            .db_context(BACKEND, "stats")?;
        let mut documents_by_status = DocumentStatusCounts::default();
        let mut documents = 0;
        for (status, n) in by_status {
            documents += n;
            match DocumentStatus::from_str(&status)? {
                DocumentStatus::Pending => documents_by_status.pending += n,
                DocumentStatus::Indexed => documents_by_status.indexed += n,
                DocumentStatus::Failed => documents_by_status.failed += n,
            }
        }

        let (chunks, embedded_chunks, tags, queue_items): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM chunks), (SELECT COUNT(embedding) FROM chunks), \
             (SELECT COUNT(DISTINCT tag_id) FROM document_tags), (SELECT COUNT(*) FROM queue_items)",
        )
        .fetch_one(&pool)
        .await
        .db_context(BACKEND, "stats")?;

        Ok(StorageStats {
            documents,
            documents_by_status,
            chunks,
            embedded_chunks,
            tags,
            queue_items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs against a live server only when `QUARRY_TEST_POSTGRES_URL` is set.
    fn test_url() -> Option<String> {
        std::env::var("QUARRY_TEST_POSTGRES_URL").ok()
    }

    #[tokio::test]
    async fn test_not_initialized_without_connecting() -> anyhow::Result<()> {
        let store = PostgresStore::new("postgres://localhost/none", PostgresOptions::default(), 3);
        assert!(matches!(
            store.dequeue().await,
            Err(Error::NotInitialized { backend: BackendKind::Postgres })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_queue_and_search_round_trip() -> anyhow::Result<()> {
        let Some(url) = test_url() else {
            return Ok(());
        };
        let store = PostgresStore::new(url, PostgresOptions::default(), 3);
        store.initialize().await?;
        store.raw_execute("TRUNCATE documents, queue_items, tags CASCADE", &[]).await?;

        store.enqueue("/low", Some(QueuePriority::Low)).await?;
        store.enqueue("/high", Some(QueuePriority::High)).await?;
        assert_eq!(store.dequeue().await?.map(|i| i.file_path).as_deref(), Some("/high"));

        let doc = store.create_document(NewDocument::from_path("/a.md", "h", 1)).await?;
        store
            .create_chunks(
                doc.id,
                vec![NewChunk {
                    text: "revenue grew".into(),
                    embedding: Some(vec![1.0, 0.0, 0.0]),
                    ..Default::default()
                }],
            )
            .await?;
        let keyword = store.search_keyword("revenue", &SearchFilters::default(), 5).await?;
        assert_eq!(keyword.len(), 1);
        let semantic = store.search_semantic(&[1.0, 0.0, 0.0], &SearchFilters::default(), 5).await?;
        assert!((semantic[0].score - 1.0).abs() < 1e-6);

        assert!(store.delete_document(doc.id).await?);
        assert_eq!(store.count_chunks(Some(doc.id)).await?, 0);
        store.close().await?;
        Ok(())
    }
}
