//! Hybrid ranking on top of the storage search primitives.
//!
//! ```text
//! query ─┬─ search_keyword ──┐
//!        │                   ├─ RRF fusion ─ dedup ─ diversity ─ offset/limit
//!        └─ embed_query ─ search_semantic ┘
//! ```
//!
//! Keyword-only and semantic-only queries skip fusion and keep the primitive's
//! own scores. A hybrid query without an embedder degrades to keyword search.

pub mod dedup;
pub mod diversity;
pub mod engine;
pub mod fusion;
pub mod types;

pub use engine::SearchEngine;
pub use fusion::{RRF_K, reciprocal_rank_fusion};
pub use types::{
    AdditionalSource, DiversityMode, HitMetadata, SearchHit, SearchQuery, SearchResponse, SearchStrategy,
    check_query_ranges,
};

/// Hit `chunk_id` of document `document_id` at `/docs/doc-{document_id}.txt`.
#[cfg(test)]
pub(crate) fn test_hit(chunk_id: i64, document_id: i64, score: f32) -> SearchHit {
    SearchHit {
        document_id,
        chunk_id,
        file_path: format!("/docs/doc-{document_id}.txt"),
        file_name: format!("doc-{document_id}.txt"),
        chunk_text: format!("passage {chunk_id}"),
        score,
        match_type: crate::storage::MatchType::Hybrid,
        highlights: Vec::new(),
        metadata: HitMetadata::default(),
        additional_sources: Vec::new(),
        embedding: None,
    }
}
