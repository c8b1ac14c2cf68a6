//! Storage abstraction layer for quarry-retriever
//!
//! Every index and query operation goes through the [`StorageAdapter`] trait.
//! Each physical engine family has one implementation, and all of them share
//! the same semantics: documents own chunks and tag links (deletes cascade),
//! lookups of missing rows return `None`, deletes are idempotent, and the
//! indexing queue hands each pending item to exactly one caller.
//!
//! ## Key Components
//!
//! - **StorageAdapter**: the operation set every backend implements
//! - **Data Types**: Document, Chunk, QueueItem, RawHit and their inputs/patches
//! - **options**: typed per-backend tunables
//! - **factory**: backend selection and database metadata
//!
//! ## Architecture
//!
//! ```text
//!                 ┌─ SqliteStore   (feature "sqlite")
//! StorageFactory ─┼─ PostgresStore (feature "postgres")
//!   (metadata)    └─ lancedb / libsql: options only, no provider
//! ```

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

pub mod factory;
pub mod metadata;
pub mod options;
#[cfg(feature = "postgres")]
pub mod postgres_store;
#[cfg(any(feature = "sqlite", feature = "postgres"))]
mod sql;
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use factory::{
    BackendProvider, ConfigMismatch, OpenContext, OpenedStorage, ProviderRegistry, RuntimeCapabilities,
    StorageFactory, is_backend_available,
};
pub use metadata::DatabaseMetadata;
pub use options::{
    BackendKind, BackendOptions, BackendOptionsPatch, DistanceMetric, default_backend_options,
    merge_backend_options, typed_backend_options, validate_backend_options,
};

/// Database ID for a document.
pub type DocumentId = i64;

/// Database ID for a text chunk.
pub type ChunkId = i64;

/// Database ID for an indexing queue entry.
pub type QueueItemId = i64;

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::invalid_input(format!(
                        "unknown {} '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

text_enum!(
    /// Indexing lifecycle of a document.
    DocumentStatus {
        Pending => "pending",
        Indexed => "indexed",
        Failed => "failed",
    }
);

text_enum!(
    OcrStatus {
        NotNeeded => "not_needed",
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
    }
);

text_enum!(
    QueuePriority {
        Low => "low",
        Normal => "normal",
        High => "high",
    }
);

text_enum!(
    QueueItemStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
);

text_enum!(
    /// Which retrieval path produced a hit.
    MatchType {
        Keyword => "keyword",
        Semantic => "semantic",
        Hybrid => "hybrid",
        Document => "document",
    }
);

impl Default for QueuePriority {
    fn default() -> Self {
        QueuePriority::Normal
    }
}

impl QueuePriority {
    /// Sort key: higher is dequeued first.
    pub fn rank(&self) -> i64 {
        match self {
            QueuePriority::Low => 0,
            QueuePriority::Normal => 1,
            QueuePriority::High => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Result<Self> {
        match rank {
            0 => Ok(QueuePriority::Low),
            1 => Ok(QueuePriority::Normal),
            2 => Ok(QueuePriority::High),
            other => Err(Error::invalid_input(format!("unknown queue priority rank {other}"))),
        }
    }
}

impl QueueItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueItemStatus::Completed | QueueItemStatus::Failed)
    }
}

/// A source file known to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub file_path: String,
    pub file_name: String,
    /// Lowercase with a leading dot, or empty
    pub file_extension: String,
    pub file_size: i64,
    pub file_hash: String,
    pub mime_type: Option<String>,
    pub file_modified_at: Option<DateTime<Utc>>,
    pub status: DocumentStatus,
    pub ocr_status: OcrStatus,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`StorageAdapter::create_document`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewDocument {
    pub file_path: String,
    pub file_name: String,
    pub file_extension: String,
    pub file_size: i64,
    pub file_hash: String,
    pub mime_type: Option<String>,
    pub file_modified_at: Option<DateTime<Utc>>,
    /// Defaults to pending
    pub status: Option<DocumentStatus>,
    /// Defaults to not_needed
    pub ocr_status: Option<OcrStatus>,
    pub title: Option<String>,
}

impl NewDocument {
    /// Derive the file name and extension from `file_path`.
    pub fn from_path(file_path: impl Into<String>, file_hash: impl Into<String>, file_size: i64) -> Self {
        let file_path = file_path.into();
        let path = Path::new(&file_path);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_path.clone());
        let file_extension = path
            .extension()
            .map(|e| normalize_extension(&e.to_string_lossy()))
            .unwrap_or_default();
        Self {
            file_name,
            file_extension,
            file_size,
            file_hash: file_hash.into(),
            file_path,
            ..Default::default()
        }
    }
}

/// Partial update for a document. `None` leaves a field unchanged.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentPatch {
    pub file_size: Option<i64>,
    pub file_hash: Option<String>,
    pub mime_type: Option<String>,
    pub file_modified_at: Option<DateTime<Utc>>,
    pub status: Option<DocumentStatus>,
    pub ocr_status: Option<OcrStatus>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentFilter {
    /// Keep documents whose path contains any of these (prefixes included)
    pub folders: Vec<String>,
    /// Keep documents with any of these extensions, with or without the dot
    pub file_extensions: Vec<String>,
    pub status: Option<DocumentStatus>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// A slice of a document's extracted text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub chunk_index: i64,
    pub text: String,
    pub start_offset: i64,
    pub end_offset: i64,
    pub page: Option<i64>,
    pub section: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewChunk {
    pub chunk_index: i64,
    pub text: String,
    pub start_offset: i64,
    pub end_offset: i64,
    pub page: Option<i64>,
    pub section: Option<String>,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingUpdate {
    pub chunk_id: ChunkId,
    pub embedding: Vec<f32>,
}

/// A chunk still waiting for its vector.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChunk {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCount {
    pub tag: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub file_path: String,
    pub priority: QueuePriority,
    pub status: QueueItemStatus,
    pub attempts: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueueItemPatch {
    pub status: Option<QueueItemStatus>,
    pub priority: Option<QueuePriority>,
    pub error: Option<String>,
    /// Stamped automatically when `status` becomes terminal and this is `None`
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PriorityCounts {
    pub low: i64,
    pub normal: i64,
    pub high: i64,
}

/// Snapshot of the indexing queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    /// Pending items only
    pub by_priority: PriorityCounts,
}

/// Restricts search primitives to part of the corpus.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    pub folders: Vec<String>,
    pub file_types: Vec<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.file_types.is_empty()
    }

    pub(crate) fn normalized_types(&self) -> Vec<String> {
        self.file_types.iter().map(|t| normalize_extension(t)).collect()
    }
}

/// A scored chunk returned by a search primitive, before any ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawHit {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub file_path: String,
    pub file_name: String,
    pub chunk_index: i64,
    pub text: String,
    pub score: f32,
    pub match_type: MatchType,
    pub highlights: Vec<String>,
    pub page: Option<i64>,
    pub section: Option<String>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DocumentStatusCounts {
    pub pending: i64,
    pub indexed: i64,
    pub failed: i64,
}

/// Aggregate counts across the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub documents: i64,
    pub documents_by_status: DocumentStatusCounts,
    pub chunks: i64,
    pub embedded_chunks: i64,
    pub tags: i64,
    pub queue_items: i64,
}

/// Backend-agnostic storage operations.
///
/// Every operation other than `initialize`, `close`, `is_ready` and `backend`
/// fails with [`Error::NotInitialized`] until `initialize` has run.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Length every stored embedding must have
    fn embedding_dimensions(&self) -> usize;

    /// Open or create the physical database. Calling it again is a no-op.
    async fn initialize(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_ready(&self) -> bool;

    // Documents

    async fn create_document(&self, document: NewDocument) -> Result<Document>;

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>>;

    async fn get_document_by_path(&self, file_path: &str) -> Result<Option<Document>>;

    /// Apply `patch` and bump `updated_at`. Returns `None` if the document does not exist.
    async fn update_document(&self, id: DocumentId, patch: DocumentPatch) -> Result<Option<Document>>;

    /// Delete a document with its chunks and tag links. Returns whether it existed.
    async fn delete_document(&self, id: DocumentId) -> Result<bool>;

    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>>;

    async fn count_documents(&self, filter: &DocumentFilter) -> Result<i64>;

    // Chunks

    async fn create_chunks(&self, document_id: DocumentId, chunks: Vec<NewChunk>) -> Result<Vec<ChunkId>>;

    /// All chunks of a document, ordered by `chunk_index`.
    async fn get_chunks(&self, document_id: DocumentId) -> Result<Vec<Chunk>>;

    async fn delete_chunks(&self, document_id: DocumentId) -> Result<u64>;

    /// Apply every update in one transaction.
    async fn update_embeddings(&self, updates: &[EmbeddingUpdate]) -> Result<()>;

    async fn count_chunks(&self, document_id: Option<DocumentId>) -> Result<i64>;

    async fn chunks_without_embeddings(&self, limit: usize) -> Result<Vec<PendingChunk>>;

    // Tags

    async fn add_tags(&self, document_id: DocumentId, tags: &[String]) -> Result<()>;

    async fn remove_tags(&self, document_id: DocumentId, tags: &[String]) -> Result<()>;

    async fn get_tags(&self, document_id: DocumentId) -> Result<Vec<String>>;

    async fn get_all_tags(&self) -> Result<Vec<TagCount>>;

    // Queue

    async fn enqueue(&self, file_path: &str, priority: Option<QueuePriority>) -> Result<QueueItem>;

    /// Claim the highest-priority, oldest pending item and mark it processing.
    ///
    /// Concurrent callers never receive the same item.
    async fn dequeue(&self) -> Result<Option<QueueItem>>;

    async fn update_queue_item(&self, id: QueueItemId, patch: QueueItemPatch) -> Result<Option<QueueItem>>;

    async fn queue_status(&self) -> Result<QueueStatus>;

    async fn clear_completed(&self) -> Result<u64>;

    async fn clear_queue(&self) -> Result<u64>;

    // Search primitives

    async fn search_keyword(&self, query: &str, filters: &SearchFilters, limit: usize) -> Result<Vec<RawHit>>;

    async fn search_semantic(&self, vector: &[f32], filters: &SearchFilters, limit: usize)
    -> Result<Vec<RawHit>>;

    // Sync helpers

    /// Path to content hash for every document.
    async fn file_hashes(&self) -> Result<HashMap<String, String>>;

    async fn documents_modified_since(&self, since: DateTime<Utc>) -> Result<Vec<Document>>;

    // Config store

    async fn get_config(&self, key: &str) -> Result<Option<String>>;

    async fn set_config(&self, key: &str, value: &str) -> Result<()>;

    async fn delete_config(&self, key: &str) -> Result<bool>;

    // Raw escape hatch

    async fn raw_query(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>>;

    async fn raw_execute(&self, sql: &str, params: &[serde_json::Value]) -> Result<u64>;

    async fn stats(&self) -> Result<StorageStats>;
}

/// Lowercase with exactly one leading dot; empty stays empty.
pub fn normalize_extension(extension: &str) -> String {
    let trimmed = extension.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(".{}", trimmed.to_lowercase())
    }
}

/// Embeddings are stored as little-endian f32 whatever the host byte order.
pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    if cfg!(target_endian = "little") {
        bytemuck::cast_slice::<f32, u8>(embedding).to_vec()
    } else {
        embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

pub(crate) fn embedding_from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    if cfg!(target_endian = "little") {
        if let Ok(floats) = bytemuck::try_cast_slice::<u8, f32>(bytes) {
            return Some(floats.to_vec());
        }
    }
    // Blob buffers are not guaranteed to be 4-byte aligned.
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

pub(crate) fn check_dimensions(expected: usize, embedding: &[f32]) -> Result<()> {
    if embedding.len() != expected {
        return Err(Error::invalid_input(format!(
            "embedding has {} dimensions, the store expects {expected}",
            embedding.len()
        )));
    }
    Ok(())
}

pub(crate) fn check_limit(limit: usize) -> Result<()> {
    if limit == 0 {
        return Err(Error::invalid_input("limit must be at least 1"));
    }
    Ok(())
}
