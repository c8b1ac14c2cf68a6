//! SQLite implementation of [`StorageAdapter`].
//!
//! One database file per data directory, opened through `sqlx` with WAL
//! journaling, a busy timeout and foreign keys enabled.
//!
//! ## Database Schema
//!
//! ```sql
//! documents      -- one row per source file, file_path UNIQUE
//! chunks         -- document_id REFERENCES documents ON DELETE CASCADE,
//!                -- embedding BLOB of little-endian f32
//! chunks_fts     -- external-content FTS5 over chunks.text, kept in sync by triggers
//! tags, document_tags
//! queue_items    -- priority stored as an integer rank (high = 2)
//! config         -- key/value settings scoped to this database
//! ```
//!
//! Keyword search ranks with `bm25()` and highlights with `snippet()`.
//! Semantic search scores every embedded chunk with the configured distance
//! metric; no ANN index is built.

use super::options::{BackendKind, SqliteOptions};
use super::sql::{push_path_filters, search_terms};
use super::{
    Chunk, ChunkId, DocumentFilter, Document, DocumentId, DocumentPatch, DocumentStatus,
    DocumentStatusCounts, EmbeddingUpdate, MatchType, NewChunk, NewDocument, OcrStatus, PendingChunk,
    PriorityCounts, QueueItem, QueueItemId, QueueItemPatch, QueueItemStatus, QueuePriority, QueueStatus,
    RawHit, SearchFilters, StorageAdapter, StorageStats, TagCount, check_dimensions, check_limit,
    embedding_from_bytes, embedding_to_bytes, from_millis, normalize_extension, to_millis,
};
use crate::error::{DbContext, Error, Result};
use crate::vector;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Column, QueryBuilder, Row, Sqlite, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// File name of the database inside the data directory.
pub const DATABASE_FILE: &str = "quarry.db";

const BACKEND: BackendKind = BackendKind::Sqlite;

const DEFAULT_MAX_QUEUE_DEPTH: usize = 10_000;

const DOCUMENT_COLUMNS: &str = "id, file_path, file_name, file_extension, file_size, file_hash, mime_type, \
     file_modified_at, status, ocr_status, title, created_at, updated_at";

const CHUNK_COLUMNS: &str =
    "id, document_id, chunk_index, text, start_offset, end_offset, page, section, embedding, created_at";

const QUEUE_COLUMNS: &str =
    "id, file_path, priority, status, attempts, error, created_at, updated_at, started_at, completed_at";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_path TEXT NOT NULL UNIQUE,
        file_name TEXT NOT NULL,
        file_extension TEXT NOT NULL DEFAULT '',
        file_size INTEGER NOT NULL DEFAULT 0,
        file_hash TEXT NOT NULL,
        mime_type TEXT,
        file_modified_at INTEGER,
        status TEXT NOT NULL DEFAULT 'pending',
        ocr_status TEXT NOT NULL DEFAULT 'not_needed',
        title TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)",
    "CREATE INDEX IF NOT EXISTS idx_documents_modified ON documents(file_modified_at)",
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        chunk_index INTEGER NOT NULL,
        text TEXT NOT NULL,
        start_offset INTEGER NOT NULL DEFAULT 0,
        end_offset INTEGER NOT NULL DEFAULT 0,
        page INTEGER,
        section TEXT,
        embedding BLOB,
        created_at INTEGER NOT NULL,
        UNIQUE(document_id, chunk_index)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id, chunk_index)",
    r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
        text,
        content='chunks',
        content_rowid='id',
        tokenize='unicode61 remove_diacritics 2'
    )
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS chunks_fts_insert AFTER INSERT ON chunks BEGIN
        INSERT INTO chunks_fts(rowid, text) VALUES (new.id, new.text);
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS chunks_fts_delete AFTER DELETE ON chunks BEGIN
        INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.id, old.text);
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS chunks_fts_update AFTER UPDATE OF text ON chunks BEGIN
        INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.id, old.text);
        INSERT INTO chunks_fts(rowid, text) VALUES (new.id, new.text);
    END
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS document_tags (
        document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
        PRIMARY KEY (document_id, tag_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_path TEXT NOT NULL,
        priority INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        started_at INTEGER,
        completed_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_queue_claim ON queue_items(status, priority DESC, created_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_queue_path ON queue_items(file_path)",
    r#"
    CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
];

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// SQLite-backed storage. See module docs for the schema.
pub struct SqliteStore {
    location: Location,
    options: SqliteOptions,
    dimensions: usize,
    max_queue_depth: usize,
    pool: RwLock<Option<SqlitePool>>,
    ready: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
}

impl SqliteStore {
    /// A store whose database lives at `<data_dir>/quarry.db`.
    pub fn new(data_dir: &Path, options: SqliteOptions, dimensions: usize) -> Self {
        Self::with_location(Location::File(data_dir.join(DATABASE_FILE)), options, dimensions)
    }

    /// A private in-memory database, mostly for tests.
    pub fn in_memory(options: SqliteOptions, dimensions: usize) -> Self {
        Self::with_location(Location::Memory, options, dimensions)
    }

    fn with_location(location: Location, options: SqliteOptions, dimensions: usize) -> Self {
        Self {
            location,
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

    pub fn options(&self) -> &SqliteOptions {
        &self.options
    }

    fn pool(&self) -> Result<SqlitePool> {
        if !self.is_ready() {
            return Err(Error::NotInitialized { backend: BACKEND });
        }
        self.pool
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(Error::NotInitialized { backend: BACKEND })
    }

    async fn connect(&self) -> Result<SqlitePool> {
        match &self.location {
            Location::File(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
                    .busy_timeout(Duration::from_secs(5))
                    .foreign_keys(true)
                    .create_if_missing(true);
                SqlitePoolOptions::new()
                    .max_connections(8)
                    .connect_with(options)
                    .await
                    .db_context(BACKEND, "open")
            }
            Location::Memory => {
                let options = SqliteConnectOptions::from_str("sqlite::memory:")
                    .db_context(BACKEND, "open")?
                    .foreign_keys(true);
                // Every connection would get its own empty database, so keep exactly one alive.
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(options)
                    .await
                    .db_context(BACKEND, "open")
            }
        }
    }

    async fn require_document(&self, pool: &SqlitePool, id: DocumentId) -> Result<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM documents WHERE id = ?")
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

fn push_document_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &DocumentFilter) {
    push_path_filters(qb, &filter.folders, &filter.file_extensions);
    if let Some(status) = filter.status {
        qb.push(" AND d.status = ").push_bind(status.as_str());
    }
}

/// FTS5 query matching any of the query's words. Empty when nothing is searchable.
fn fts_query(query: &str) -> String {
    search_terms(query)
        .iter()
        .map(|term| format!("\"{term}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn decode<T>(result: std::result::Result<T, sqlx::Error>) -> Result<T> {
    result.db_context(BACKEND, "decode row")
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
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

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    let embedding: Option<Vec<u8>> = decode(row.try_get("embedding"))?;
    Ok(Chunk {
        id: decode(row.try_get("id"))?,
        document_id: decode(row.try_get("document_id"))?,
        chunk_index: decode(row.try_get("chunk_index"))?,
        text: decode(row.try_get("text"))?,
        start_offset: decode(row.try_get("start_offset"))?,
        end_offset: decode(row.try_get("end_offset"))?,
        page: decode(row.try_get("page"))?,
        section: decode(row.try_get("section"))?,
        embedding: embedding.as_deref().and_then(embedding_from_bytes),
        created_at: from_millis(decode(row.try_get("created_at"))?),
    })
}

fn queue_item_from_row(row: &SqliteRow) -> Result<QueueItem> {
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

/// Hit columns selected by both search primitives; `c` is chunks, `d` is documents.
const HIT_COLUMNS: &str = "c.id AS chunk_id, c.document_id, d.file_path, d.file_name, c.chunk_index, \
     c.text, c.page, c.section, c.embedding";

fn hit_from_row(row: &SqliteRow, score: f32, match_type: MatchType, highlights: Vec<String>) -> Result<RawHit> {
    let embedding: Option<Vec<u8>> = decode(row.try_get("embedding"))?;
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
        embedding: embedding.as_deref().and_then(embedding_from_bytes),
    })
}

fn bind_json<'q>(
    mut query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &[serde_json::Value],
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
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

fn row_to_json(row: &SqliteRow) -> Result<serde_json::Map<String, serde_json::Value>> {
    use serde_json::Value;
    let mut map = serde_json::Map::new();
    for column in row.columns() {
        let index = column.ordinal();
        let (is_null, type_name) = {
            let raw = decode(row.try_get_raw(index))?;
            (raw.is_null(), raw.type_info().name().to_string())
        };
        let value = if is_null {
            Value::Null
        } else {
            match type_name.as_str() {
                "INTEGER" | "BOOLEAN" => Value::from(decode(row.try_get_unchecked::<i64, _>(index))?),
                "REAL" => Value::from(decode(row.try_get_unchecked::<f64, _>(index))?),
                "BLOB" => Value::from(decode(row.try_get_unchecked::<Vec<u8>, _>(index))?),
                _ => Value::from(decode(row.try_get_unchecked::<String, _>(index))?),
            }
        };
        map.insert(column.name().to_string(), value);
    }
    Ok(map)
}

#[async_trait]
impl StorageAdapter for SqliteStore {
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

        let pool = self.connect().await?;
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .db_context(BACKEND, "create schema")?;
        }
        match &self.location {
            Location::File(path) => info!("Opened SQLite store at {}", path.display()),
            Location::Memory => debug!("Opened in-memory SQLite store"),
        }

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
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {DOCUMENT_COLUMNS}"
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
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&pool)
            .await
            .db_context(BACKEND, "get_document")?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn get_document_by_path(&self, file_path: &str) -> Result<Option<Document>> {
        let pool = self.pool()?;
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE file_path = ?");
        let row = sqlx::query(&sql)
            .bind(file_path)
            .fetch_optional(&pool)
            .await
            .db_context(BACKEND, "get_document_by_path")?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn update_document(&self, id: DocumentId, patch: DocumentPatch) -> Result<Option<Document>> {
        let pool = self.pool()?;
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE documents SET updated_at = ");
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
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&pool)
            .await
            .db_context(BACKEND, "delete_document")?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>> {
        let pool = self.pool()?;
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {DOCUMENT_COLUMNS} FROM documents d WHERE 1 = 1"));
        push_document_filter(&mut qb, filter);
        qb.push(" ORDER BY d.file_path LIMIT ")
            .push_bind(filter.limit.map(|l| l as i64).unwrap_or(-1))
            .push(" OFFSET ")
            .push_bind(filter.offset as i64);

        let rows = qb
            .build()
            .fetch_all(&pool)
            .await
            .db_context(BACKEND, "list_documents")?;
        rows.iter().map(document_from_row).collect()
    }

    async fn count_documents(&self, filter: &DocumentFilter) -> Result<i64> {
        let pool = self.pool()?;
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM documents d WHERE 1 = 1");
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
                 embedding, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
            )
            .bind(document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(chunk.start_offset)
            .bind(chunk.end_offset)
            .bind(chunk.page)
            .bind(&chunk.section)
            .bind(chunk.embedding.as_deref().map(embedding_to_bytes))
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
        let sql = format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE document_id = ? ORDER BY chunk_index");
        let rows = sqlx::query(&sql)
            .bind(document_id)
            .fetch_all(&pool)
            .await
            .db_context(BACKEND, "get_chunks")?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn delete_chunks(&self, document_id: DocumentId) -> Result<u64> {
        let pool = self.pool()?;
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
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
            let result = sqlx::query("UPDATE chunks SET embedding = ? WHERE id = ?")
                .bind(embedding_to_bytes(&update.embedding))
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
        let query = match document_id {
            Some(id) => sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?").bind(id),
            None => sqlx::query_scalar("SELECT COUNT(*) FROM chunks"),
        };
        query.fetch_one(&pool).await.db_context(BACKEND, "count_chunks")
    }

    async fn chunks_without_embeddings(&self, limit: usize) -> Result<Vec<PendingChunk>> {
        check_limit(limit)?;
        let pool = self.pool()?;
        let rows = sqlx::query("SELECT id, document_id, text FROM chunks WHERE embedding IS NULL ORDER BY id LIMIT ?")
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
            sqlx::query("INSERT INTO tags (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
                .bind(tag)
                .execute(&mut *tx)
                .await
                .db_context(BACKEND, "add_tags")?;
            sqlx::query(
                "INSERT OR IGNORE INTO document_tags (document_id, tag_id) SELECT ?, id FROM tags WHERE name = ?",
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
        let mut tx = pool.begin().await.db_context(BACKEND, "remove_tags")?;
        for tag in tags {
            sqlx::query(
                "DELETE FROM document_tags WHERE document_id = ? AND tag_id IN (SELECT id FROM tags WHERE name = ?)",
            )
            .bind(document_id)
            .bind(tag.trim())
            .execute(&mut *tx)
            .await
            .db_context(BACKEND, "remove_tags")?;
        }
        tx.commit().await.db_context(BACKEND, "remove_tags")
    }

    async fn get_tags(&self, document_id: DocumentId) -> Result<Vec<String>> {
        let pool = self.pool()?;
        sqlx::query_scalar(
            "SELECT t.name FROM tags t JOIN document_tags dt ON dt.tag_id = t.id \
             WHERE dt.document_id = ? ORDER BY t.name",
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
             JOIN document_tags dt ON dt.tag_id = t.id GROUP BY t.id ORDER BY count DESC, t.name",
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
            "UPDATE queue_items SET priority = MAX(priority, ?), updated_at = ? \
             WHERE id = (SELECT id FROM queue_items WHERE file_path = ? AND status = 'pending' LIMIT 1) \
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
             VALUES (?, ?, 'pending', ?, ?) RETURNING {QUEUE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(file_path)
            .bind(priority.rank())
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .db_context(BACKEND, "enqueue")?;
        tx.commit().await.db_context(BACKEND, "enqueue")?;
        queue_item_from_row(&row)
    }

    async fn dequeue(&self) -> Result<Option<QueueItem>> {
        let pool = self.pool()?;
        // A single UPDATE holds the write lock for the whole select-and-claim.
        let sql = format!(
            "UPDATE queue_items SET status = 'processing', started_at = ?1, updated_at = ?1, \
             attempts = attempts + 1 \
             WHERE id = (SELECT id FROM queue_items WHERE status = 'pending' \
                         ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1) \
             AND status = 'pending' \
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
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE queue_items SET updated_at = ");
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
        let rows = sqlx::query("SELECT status, priority, COUNT(*) AS n FROM queue_items GROUP BY status, priority")
            .fetch_all(&pool)
            .await
            .db_context(BACKEND, "queue_status")?;

        let mut status = QueueStatus::default();
        for row in &rows {
            let state: String = decode(row.try_get("status"))?;
            let priority = QueuePriority::from_rank(decode(row.try_get("priority"))?)?;
            let n: i64 = decode(row.try_get("n"))?;
            status.total += n;
            match QueueItemStatus::from_str(&state)? {
                QueueItemStatus::Pending => {
                    status.pending += n;
                    match priority {
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
        let fts = fts_query(query);
        if fts.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {HIT_COLUMNS}, bm25(chunks_fts) AS bm25_score, \
             snippet(chunks_fts, 0, '<mark>', '</mark>', '...', 12) AS highlight \
             FROM chunks_fts JOIN chunks c ON c.id = chunks_fts.rowid \
             JOIN documents d ON d.id = c.document_id \
             WHERE chunks_fts MATCH "
        ));
        qb.push_bind(fts);
        push_path_filters(&mut qb, &filters.folders, &filters.normalized_types());
        qb.push(" ORDER BY bm25_score LIMIT ").push_bind(limit as i64);

        let rows = qb
            .build()
            .fetch_all(&pool)
            .await
            .db_context(BACKEND, "search_keyword")?;
        rows.iter()
            .map(|row| {
                let rank: f64 = decode(row.try_get("bm25_score"))?;
                let highlight: Option<String> = decode(row.try_get("highlight"))?;
                let highlights = highlight.filter(|h| !h.is_empty()).into_iter().collect();
                // bm25() is lower-is-better and negative for matches.
                hit_from_row(row, (-rank) as f32, MatchType::Keyword, highlights)
            })
            .collect()
    }

    async fn search_semantic(&self, vector: &[f32], filters: &SearchFilters, limit: usize) -> Result<Vec<RawHit>> {
        check_limit(limit)?;
        check_dimensions(self.dimensions, vector)?;
        let pool = self.pool()?;

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
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
             WHERE updated_at >= ?1 OR file_modified_at >= ?1 ORDER BY updated_at, id"
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
        sqlx::query_scalar("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&pool)
            .await
            .db_context(BACKEND, "get_config")
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let pool = self.pool()?;
        sqlx::query(
            "INSERT INTO config (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
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
        let result = sqlx::query("DELETE FROM config WHERE key = ?")
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

        let (chunks, embedded_chunks): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), COUNT(embedding) FROM chunks")
                .fetch_one(&pool)
                .await
                .db_context(BACKEND, "stats")?;
        let tags: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT tag_id) FROM document_tags")
            .fetch_one(&pool)
            .await
            .db_context(BACKEND, "stats")?;
        let queue_items: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_items")
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
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn open(dir: &Path) -> anyhow::Result<SqliteStore> {
        let store = SqliteStore::new(dir, SqliteOptions::default(), 3);
        store.initialize().await?;
        Ok(store)
    }

    fn chunk(index: i64, text: &str, embedding: Option<Vec<f32>>) -> NewChunk {
        NewChunk {
            chunk_index: index,
            text: text.to_string(),
            start_offset: index * 100,
            end_offset: index * 100 + text.len() as i64,
            embedding,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_operations_before_initialize_fail() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = SqliteStore::new(dir.path(), SqliteOptions::default(), 3);
        assert!(!store.is_ready());
        assert!(matches!(
            store.get_document(1).await,
            Err(Error::NotInitialized { backend: BackendKind::Sqlite })
        ));

        store.initialize().await?;
        store.initialize().await?;
        assert!(store.is_ready());

        store.close().await?;
        assert!(!store.is_ready());
        assert!(store.count_documents(&DocumentFilter::default()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_document_crud() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = open(dir.path()).await?;

        let created = store
            .create_document(NewDocument::from_path("/notes/plan.MD", "h1", 10))
            .await?;
        assert_eq!(created.status, DocumentStatus::Pending);
        assert_eq!(created.ocr_status, OcrStatus::NotNeeded);
        assert_eq!(created.file_extension, ".md");

        assert_eq!(store.get_document(created.id).await?, Some(created.clone()));
        assert_eq!(store.get_document_by_path("/notes/plan.MD").await?.map(|d| d.id), Some(created.id));
        assert_eq!(store.get_document(9999).await?, None);
        assert_eq!(store.get_document_by_path("/missing").await?, None);

        let updated = store
            .update_document(
                created.id,
                DocumentPatch {
                    status: Some(DocumentStatus::Indexed),
                    title: Some("Plan".into()),
                    ..Default::default()
                },
            )
            .await?
            .unwrap();
        assert_eq!(updated.status, DocumentStatus::Indexed);
        assert_eq!(updated.title.as_deref(), Some("Plan"));
        assert_eq!(updated.file_hash, "h1");
        assert!(updated.updated_at >= created.updated_at);
        assert!(store.update_document(9999, DocumentPatch::default()).await?.is_none());

        let duplicate = store
            .create_document(NewDocument::from_path("/notes/plan.MD", "h2", 1))
            .await;
        assert!(matches!(duplicate, Err(Error::Conflict { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_cascades_and_is_idempotent() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = open(dir.path()).await?;
        let doc = store.create_document(NewDocument::from_path("/a.txt", "h", 1)).await?;
        store
            .create_chunks(doc.id, vec![chunk(0, "one", None), chunk(1, "two", None), chunk(2, "three", None)])
            .await?;
        store.add_tags(doc.id, &["work".into()]).await?;
        assert_eq!(store.count_chunks(Some(doc.id)).await?, 3);

        assert!(store.delete_document(doc.id).await?);
        assert_eq!(store.count_chunks(Some(doc.id)).await?, 0);
        assert!(store.get_all_tags().await?.is_empty());
        assert!(store.search_keyword("two", &SearchFilters::default(), 10).await?.is_empty());

        assert!(!store.delete_document(doc.id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_documents_filters() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = open(dir.path()).await?;
        for path in ["/work/a.pdf", "/work/b.md", "/home/c.pdf", "/home/notes_1.txt"] {
            store.create_document(NewDocument::from_path(path, "h", 1)).await?;
        }

        let work = DocumentFilter {
            folders: vec!["/work".into()],
            ..Default::default()
        };
        assert_eq!(store.count_documents(&work).await?, 2);

        let pdfs = DocumentFilter {
            file_extensions: vec!["PDF".into()],
            ..Default::default()
        };
        let listed = store.list_documents(&pdfs).await?;
        assert_eq!(
            listed.iter().map(|d| d.file_path.as_str()).collect::<Vec<_>>(),
            vec!["/home/c.pdf", "/work/a.pdf"]
        );

        // Underscore is literal, not a LIKE wildcard.
        let literal = DocumentFilter {
            folders: vec!["notes_".into()],
            ..Default::default()
        };
        assert_eq!(store.count_documents(&literal).await?, 1);

        let page = DocumentFilter {
            limit: Some(2),
            offset: 1,
            ..Default::default()
        };
        assert_eq!(store.list_documents(&page).await?.len(), 2);

        let indexed = DocumentFilter {
            status: Some(DocumentStatus::Indexed),
            ..Default::default()
        };
        assert_eq!(store.count_documents(&indexed).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_chunks_and_embeddings() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = open(dir.path()).await?;
        let doc = store.create_document(NewDocument::from_path("/a.txt", "h", 1)).await?;
        let ids = store
            .create_chunks(doc.id, vec![chunk(1, "second", None), chunk(0, "first", None)])
            .await?;

        let chunks = store.get_chunks(doc.id).await?;
        assert_eq!(chunks.iter().map(|c| c.text.as_str()).collect::<Vec<_>>(), vec!["first", "second"]);
        assert_eq!(store.chunks_without_embeddings(10).await?.len(), 2);

        store
            .update_embeddings(&[
                EmbeddingUpdate { chunk_id: ids[0], embedding: vec![0.0, 1.0, 0.0] },
                EmbeddingUpdate { chunk_id: ids[1], embedding: vec![1.0, 0.0, 0.0] },
            ])
            .await?;
        let chunks = store.get_chunks(doc.id).await?;
        assert_eq!(chunks[0].embedding, Some(vec![1.0, 0.0, 0.0]));
        assert!(store.chunks_without_embeddings(10).await?.is_empty());

        let wrong = store
            .update_embeddings(&[EmbeddingUpdate { chunk_id: ids[0], embedding: vec![1.0] }])
            .await;
        assert!(matches!(wrong, Err(Error::InvalidInput { .. })));

        assert!(matches!(
            store.create_chunks(424242, vec![chunk(0, "orphan", None)]).await,
            Err(Error::NotFound { .. })
        ));
        assert_eq!(store.delete_chunks(doc.id).await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_tags_are_a_set() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = open(dir.path()).await?;
        let a = store.create_document(NewDocument::from_path("/a", "h", 1)).await?;
        let b = store.create_document(NewDocument::from_path("/b", "h", 1)).await?;

        store.add_tags(a.id, &["rust".into(), "db".into()]).await?;
        store.add_tags(a.id, &["rust".into()]).await?;
        store.add_tags(b.id, &["rust".into()]).await?;

        assert_eq!(store.get_tags(a.id).await?, vec!["db", "rust"]);
        assert_eq!(
            store.get_all_tags().await?,
            vec![
                TagCount { tag: "rust".into(), count: 2 },
                TagCount { tag: "db".into(), count: 1 },
            ]
        );

        store.remove_tags(a.id, &["rust".into()]).await?;
        assert_eq!(store.get_tags(a.id).await?, vec!["db"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_dequeue_by_priority() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = open(dir.path()).await?;
        store.enqueue("/low", Some(QueuePriority::Low)).await?;
        store.enqueue("/high", Some(QueuePriority::High)).await?;
        let normal = store.enqueue("/normal", None).await?;
        assert_eq!(normal.priority, QueuePriority::Normal);

        let mut order = Vec::new();
        while let Some(item) = store.dequeue().await? {
            assert_eq!(item.status, QueueItemStatus::Processing);
            assert_eq!(item.attempts, 1);
            assert!(item.started_at.is_some());
            order.push(item.file_path);
        }
        assert_eq!(order, vec!["/high", "/normal", "/low"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_queue_status_counts() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = open(dir.path()).await?;
        store.enqueue("/a", Some(QueuePriority::High)).await?;
        store.enqueue("/b", Some(QueuePriority::Normal)).await?;

        let status = store.queue_status().await?;
        assert_eq!(status.total, 2);
        assert_eq!(status.pending, 2);
        assert_eq!(status.by_priority.high, 1);
        assert_eq!(status.by_priority.normal, 1);
        assert_eq!(status.by_priority.low, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_requeue_pending_path_keeps_one_item() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = open(dir.path()).await?;
        let first = store.enqueue("/a", Some(QueuePriority::Low)).await?;
        let again = store.enqueue("/a", Some(QueuePriority::High)).await?;
        assert_eq!(first.id, again.id);
        assert_eq!(again.priority, QueuePriority::High);
        assert_eq!(store.queue_status().await?.total, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_dequeue_never_duplicates() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = Arc::new(open(dir.path()).await?);
        for i in 0..40 {
            store.enqueue(&format!("/file-{i}"), None).await?;
        }

        let mut workers = Vec::new();
        for _ in 0..6 {
            let store = store.clone();
            workers.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(item) = store.dequeue().await? {
                    claimed.push(item.id);
                }
                Ok::<_, Error>(claimed)
            }));
        }

        let mut all = Vec::new();
        for worker in workers {
            all.extend(worker.await??);
        }
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        assert_eq!(before, 40);
        assert_eq!(all.len(), 40);
        Ok(())
    }

    #[tokio::test]
    async fn test_queue_is_bounded() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = SqliteStore::new(dir.path(), SqliteOptions::default(), 3).with_max_queue_depth(2);
        store.initialize().await?;
        store.enqueue("/a", None).await?;
        store.enqueue("/b", None).await?;
        assert!(matches!(store.enqueue("/c", None).await, Err(Error::InvalidInput { .. })));

        let item = store.dequeue().await?.unwrap();
        store
            .update_queue_item(
                item.id,
                QueueItemPatch {
                    status: Some(QueueItemStatus::Completed),
                    ..Default::default()
                },
            )
            .await?;
        store.enqueue("/c", None).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_update_and_clear_queue() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = open(dir.path()).await?;
        store.enqueue("/a", None).await?;
        store.enqueue("/b", None).await?;
        let item = store.dequeue().await?.unwrap();

        let done = store
            .update_queue_item(
                item.id,
                QueueItemPatch {
                    status: Some(QueueItemStatus::Completed),
                    ..Default::default()
                },
            )
            .await?
            .unwrap();
        assert_eq!(done.status, QueueItemStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(store.update_queue_item(9999, QueueItemPatch::default()).await?.is_none());

        assert_eq!(store.clear_completed().await?, 1);
        assert_eq!(store.queue_status().await?.total, 1);
        assert_eq!(store.clear_queue().await?, 1);
        assert_eq!(store.queue_status().await?, QueueStatus::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_keyword_search() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = open(dir.path()).await?;
        let pdf = store.create_document(NewDocument::from_path("/work/report.pdf", "h", 1)).await?;
        let md = store.create_document(NewDocument::from_path("/home/notes.md", "h", 1)).await?;
        store
            .create_chunks(pdf.id, vec![chunk(0, "Quarterly revenue grew strongly in Europe", None)])
            .await?;
        store
            .create_chunks(md.id, vec![chunk(0, "Revenue notes and revenue targets", None)])
            .await?;

        let hits = store.search_keyword("revenue", &SearchFilters::default(), 10).await?;
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.match_type == MatchType::Keyword));
        assert!(hits[0].score >= hits[1].score);
        assert!(hits[0].highlights[0].contains("<mark>"));

        let filtered = store
            .search_keyword(
                "revenue",
                &SearchFilters {
                    file_types: vec!["pdf".into()],
                    ..Default::default()
                },
                10,
            )
            .await?;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].document_id, pdf.id);

        assert!(store.search_keyword("?!", &SearchFilters::default(), 10).await?.is_empty());
        assert!(matches!(
            store.search_keyword("revenue", &SearchFilters::default(), 0).await,
            Err(Error::InvalidInput { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_semantic_search() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = open(dir.path()).await?;
        let doc = store.create_document(NewDocument::from_path("/a.txt", "h", 1)).await?;
        store
            .create_chunks(
                doc.id,
                vec![
                    chunk(0, "x", Some(vec![1.0, 0.0, 0.0])),
                    chunk(1, "y", Some(vec![0.0, 1.0, 0.0])),
                    chunk(2, "xy", Some(vec![0.7, 0.7, 0.0])),
                    chunk(3, "none", None),
                ],
            )
            .await?;

        let hits = store.search_semantic(&[1.0, 0.1, 0.0], &SearchFilters::default(), 2).await?;
        assert_eq!(hits.iter().map(|h| h.text.as_str()).collect::<Vec<_>>(), vec!["x", "xy"]);
        assert!(hits[0].score > hits[1].score);
        assert_eq!(hits[0].match_type, MatchType::Semantic);
        assert!(hits[0].embedding.is_some());

        assert!(matches!(
            store.search_semantic(&[1.0], &SearchFilters::default(), 2).await,
            Err(Error::InvalidInput { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_sync_helpers_and_config() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = open(dir.path()).await?;
        let before = Utc::now() - chrono::Duration::seconds(1);
        store.create_document(NewDocument::from_path("/a", "ha", 1)).await?;
        store.create_document(NewDocument::from_path("/b", "hb", 1)).await?;

        let hashes = store.file_hashes().await?;
        assert_eq!(hashes.get("/a").map(String::as_str), Some("ha"));
        assert_eq!(hashes.len(), 2);
        assert_eq!(store.documents_modified_since(before).await?.len(), 2);
        assert!(store
            .documents_modified_since(Utc::now() + chrono::Duration::hours(1))
            .await?
            .is_empty());

        assert_eq!(store.get_config("theme").await?, None);
        store.set_config("theme", "dark").await?;
        store.set_config("theme", "light").await?;
        assert_eq!(store.get_config("theme").await?.as_deref(), Some("light"));
        assert!(store.delete_config("theme").await?);
        assert!(!store.delete_config("theme").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_raw_query_and_stats() -> anyhow::Result<()> {
        let store = SqliteStore::in_memory(SqliteOptions::default(), 3);
        store.initialize().await?;
        let doc = store.create_document(NewDocument::from_path("/a.txt", "h", 1)).await?;
        store
            .create_chunks(doc.id, vec![chunk(0, "a", Some(vec![1.0, 0.0, 0.0])), chunk(1, "b", None)])
            .await?;
        store.add_tags(doc.id, &["t".into()]).await?;
        store.enqueue("/a.txt", None).await?;

        let rows = store
            .raw_query(
                "SELECT file_path, file_size, title FROM documents WHERE id = ?",
                &[serde_json::json!(doc.id)],
            )
            .await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["file_path"], "/a.txt");
        assert_eq!(rows[0]["file_size"], 1);
        assert!(rows[0]["title"].is_null());

        let changed = store
            .raw_execute("UPDATE documents SET title = ? WHERE id = ?", &[serde_json::json!("T"), serde_json::json!(doc.id)])
            .await?;
        assert_eq!(changed, 1);

        let stats = store.stats().await?;
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.documents_by_status.pending, 1);
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.embedded_chunks, 1);
        assert_eq!(stats.tags, 1);
        assert_eq!(stats.queue_items, 1);
        Ok(())
    }
}
