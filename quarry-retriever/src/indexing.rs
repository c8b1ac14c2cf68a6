//! Indexing driver that turns parsed documents into stored, embedded chunks.
//!
//! Parsing and OCR happen elsewhere, behind the [`DocumentSource`] contract.
//! The driver drains the storage queue one item at a time:
//!
//! ```text
//! queue ─ dequeue ─ DocumentSource::parse ─ index_document ─ mark completed/failed
//!                                              │
//!                              chunks ─ embed_batch_documents ─ update_embeddings
//! ```
//!
//! Re-indexing a document whose content hash is unchanged is a no-op.

use crate::error::{Error, Result};
use crate::storage::{
    DocumentId, DocumentPatch, DocumentStatus, EmbeddingUpdate, NewChunk, NewDocument, OcrStatus, QueueItem,
    QueueItemPatch, QueueItemStatus, StorageAdapter,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quarry_embed::Embedder;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A document after text extraction, ready to be stored.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedDocument {
    pub file_path: String,
    pub file_hash: String,
    pub file_size: i64,
    pub mime_type: Option<String>,
    pub file_modified_at: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub ocr_status: Option<OcrStatus>,
    /// Embeddings on these are ignored; the indexer computes its own
    pub chunks: Vec<NewChunk>,
    pub tags: Vec<String>,
}

impl ParsedDocument {
    /// One chunk per passage, with offsets into the concatenated passages.
    pub fn from_passages(file_path: impl Into<String>, file_hash: impl Into<String>, passages: &[&str]) -> Self {
        let mut offset = 0i64;
        let chunks = passages
            .iter()
            .enumerate()
            .map(|(index, text)| {
                let start = offset;
                offset += text.len() as i64;
                NewChunk {
                    chunk_index: index as i64,
                    text: text.to_string(),
                    start_offset: start,
                    end_offset: offset,
                    ..Default::default()
                }
            })
            .collect();
        Self {
            file_path: file_path.into(),
            file_hash: file_hash.into(),
            file_size: offset,
            chunks,
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            ..self
        }
    }
}

/// External parser/OCR stage.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn parse(&self, file_path: &str) -> Result<ParsedDocument>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed {
        document_id: DocumentId,
        chunks: usize,
        embedded: usize,
    },
    /// Same content hash as the stored, indexed document
    Unchanged { document_id: DocumentId },
}

impl IndexOutcome {
    pub fn document_id(&self) -> DocumentId {
        match self {
            IndexOutcome::Indexed { document_id, .. } | IndexOutcome::Unchanged { document_id } => *document_id,
        }
    }
}

/// Result of handling one queue item.
#[derive(Debug, Clone)]
pub struct ProcessedItem {
    /// The item as it was left in the queue
    pub item: QueueItem,
    /// The indexing outcome, or the message recorded on the failed item
    pub outcome: std::result::Result<IndexOutcome, String>,
}

pub struct DocumentIndexer {
    store: Arc<dyn StorageAdapter>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl DocumentIndexer {
    pub fn new(store: Arc<dyn StorageAdapter>) -> Self {
        Self { store, embedder: None }
    }

    pub fn with_embedder(self, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder: Some(embedder),
            ..self
        }
    }

    pub async fn index_document(&self, parsed: ParsedDocument) -> Result<IndexOutcome> {
        let ParsedDocument {
            file_path,
            file_hash,
            file_size,
            mime_type,
            file_modified_at,
            title,
            ocr_status,
            chunks,
            tags,
        } = parsed;

        let document_id = match self.store.get_document_by_path(&file_path).await? {
            Some(existing) if existing.file_hash == file_hash && existing.status == DocumentStatus::Indexed => {
                debug!(path = %file_path, "content unchanged, skipping");
                return Ok(IndexOutcome::Unchanged {
                    document_id: existing.id,
                });
            }
            Some(existing) => {
                let patch = DocumentPatch {
                    file_size: Some(file_size),
                    file_hash: Some(file_hash),
                    mime_type,
                    file_modified_at,
                    status: Some(DocumentStatus::Pending),
                    ocr_status,
                    title,
                };
                self.store
                    .update_document(existing.id, patch)
                    .await?
                    .ok_or_else(|| Error::not_found(format!("document {}", existing.id)))?;
                let removed = self.store.delete_chunks(existing.id).await?;
                debug!(path = %file_path, removed, "replacing chunks");
                existing.id
            }
            None => {
                let document = NewDocument {
                    mime_type,
                    file_modified_at,
                    title,
                    ocr_status,
                    ..NewDocument::from_path(file_path.as_str(), file_hash, file_size)
                };
                self.store.create_document(document).await?.id
            }
        };

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let chunks = chunks
            .into_iter()
            .map(|chunk| NewChunk {
                embedding: None,
                ..chunk
            })
            .collect();
        let chunk_ids = self.store.create_chunks(document_id, chunks).await?;

        let embedded = match self.embed_and_store(&chunk_ids, &texts).await {
            Ok(embedded) => embedded,
            Err(e) => {
                warn!(path = %file_path, error = %e, "embedding failed, marking document failed");
                if let Err(status_error) = self.set_status(document_id, DocumentStatus::Failed).await {
                    warn!(path = %file_path, error = %status_error, "could not mark document failed");
                }
                return Err(e);
            }
        };

        self.replace_tags(document_id, &tags).await?;
        self.set_status(document_id, DocumentStatus::Indexed).await?;

        info!(path = %file_path, chunks = chunk_ids.len(), embedded, "indexed document");
        Ok(IndexOutcome::Indexed {
            document_id,
            chunks: chunk_ids.len(),
            embedded,
        })
    }

    /// Take one item off the queue and index it. `None` when nothing is pending.
    pub async fn process_next(&self, source: &dyn DocumentSource) -> Result<Option<ProcessedItem>> {
        let Some(item) = self.store.dequeue().await? else {
            return Ok(None);
        };

        let result = match source.parse(&item.file_path).await {
            Ok(parsed) => self.index_document(parsed).await,
            Err(e) => Err(e),
        };

        let (patch, outcome) = match result {
            Ok(outcome) => (
                QueueItemPatch {
                    status: Some(QueueItemStatus::Completed),
                    ..Default::default()
                },
                Ok(outcome),
            ),
            Err(e) => {
                let message = e.to_string();
                warn!(path = %item.file_path, error = %message, "queue item failed");
                (
                    QueueItemPatch {
                        status: Some(QueueItemStatus::Failed),
                        error: Some(message.clone()),
                        ..Default::default()
                    },
                    Err(message),
                )
            }
        };

        let item = self
            .store
            .update_queue_item(item.id, patch)
            .await?
            .ok_or_else(|| Error::not_found(format!("queue item {}", item.id)))?;
        Ok(Some(ProcessedItem { item, outcome }))
    }

    /// Embed up to `limit` stored chunks that have no vector yet. Returns how many were embedded.
    pub async fn embed_pending(&self, limit: usize) -> Result<usize> {
        if self.embedder.is_none() {
            return Err(Error::configuration(
                "embedding.executor",
                "embedding pending chunks needs an embedder",
            ));
        }
        let pending = self.store.chunks_without_embeddings(limit).await?;
        let ids: Vec<_> = pending.iter().map(|p| p.chunk_id).collect();
        let texts: Vec<String> = pending.into_iter().map(|p| p.text).collect();
        let embedded = self.embed_and_store(&ids, &texts).await?;
        debug!(embedded, "embedded pending chunks");
        Ok(embedded)
    }

    async fn embed_and_store(&self, chunk_ids: &[i64], texts: &[String]) -> Result<usize> {
        let Some(embedder) = &self.embedder else {
            return Ok(0);
        };
        if texts.is_empty() {
            return Ok(0);
        }
        if !embedder.is_ready() {
            embedder.initialize(None).await?;
        }

        let vectors = embedder.embed_batch_documents(texts).await?;
        let updates: Vec<EmbeddingUpdate> = chunk_ids
            .iter()
            .zip(vectors)
            .map(|(&chunk_id, embedding)| EmbeddingUpdate { chunk_id, embedding })
            .collect();
        self.store.update_embeddings(&updates).await?;
        Ok(updates.len())
    }

    async fn replace_tags(&self, document_id: DocumentId, tags: &[String]) -> Result<()> {
        let wanted: HashSet<&str> = tags.iter().map(String::as_str).collect();
        let stale: Vec<String> = self
            .store
            .get_tags(document_id)
            .await?
            .into_iter()
            .filter(|tag| !wanted.contains(tag.as_str()))
            .collect();
        if !stale.is_empty() {
            self.store.remove_tags(document_id, &stale).await?;
        }
        if !tags.is_empty() {
            self.store.add_tags(document_id, tags).await?;
        }
        Ok(())
    }

    async fn set_status(&self, document_id: DocumentId, status: DocumentStatus) -> Result<()> {
        let patch = DocumentPatch {
            status: Some(status),
            ..Default::default()
        };
        self.store.update_document(document_id, patch).await?;
        Ok(())
    }
}
