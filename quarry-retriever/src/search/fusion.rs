// Reciprocal Rank Fusion (RRF)

use super::types::SearchHit;
use crate::storage::{ChunkId, MatchType, RawHit};
use std::collections::HashMap;

/// Standard RRF constant from Cormack, Clarke and Buettcher (SIGIR 2009).
pub const RRF_K: f32 = 60.0;

/// Fuse two ranked lists by chunk: `score = Σ 1 / (k + rank)` with 1-based ranks.
///
/// Chunks found by both lists are tagged [`MatchType::Hybrid`]. Keyword
/// highlights are kept, and an embedding missing from one side is taken
/// from the other. Equal scores keep first-seen order (keyword list first).
pub fn reciprocal_rank_fusion(keyword: Vec<RawHit>, semantic: Vec<RawHit>, k: f32) -> Vec<SearchHit> {
    let mut fused: Vec<SearchHit> = Vec::with_capacity(keyword.len() + semantic.len());
    let mut positions: HashMap<ChunkId, usize> = HashMap::new();

    for list in [keyword, semantic] {
        for (rank, hit) in list.into_iter().enumerate() {
            let contribution = 1.0 / (k + (rank + 1) as f32);
            match positions.get(&hit.chunk_id) {
                Some(&index) => {
                    let existing = &mut fused[index];
                    existing.score += contribution;
                    if existing.match_type != hit.match_type {
                        existing.match_type = MatchType::Hybrid;
                    }
                    if existing.embedding.is_none() {
                        existing.embedding = hit.embedding;
                    }
                    if existing.highlights.is_empty() {
                        existing.highlights = hit.highlights;
                    }
                }
                None => {
                    positions.insert(hit.chunk_id, fused.len());
                    let mut entry = SearchHit::from(hit);
                    entry.score = contribution;
                    fused.push(entry);
                }
            }
        }
    }

    // sort_by is stable, so ties stay in first-seen order
    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused
}

/// A single primitive's list, keeping its own scores and order.
pub fn single_source(hits: Vec<RawHit>) -> Vec<SearchHit> {
    hits.into_iter().map(SearchHit::from).collect()
}
