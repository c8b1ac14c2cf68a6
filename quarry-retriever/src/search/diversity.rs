use super::types::{DiversityMode, SearchHit};
use crate::storage::DocumentId;
use std::collections::HashMap;

/// Reshape a ranked list so one document does not crowd out the rest.
///
/// Input must already be sorted by score. The output contains every input hit.
pub fn apply_diversity(
    hits: Vec<SearchHit>,
    mode: DiversityMode,
    decay_factor: f32,
    max_per_document: usize,
) -> Vec<SearchHit> {
    match mode {
        DiversityMode::None => hits,
        DiversityMode::ScorePenalty => score_penalty(hits, decay_factor),
        DiversityMode::CapThenFill => cap_then_fill(hits, max_per_document),
    }
}

/// The k-th further passage of a document (k from 0) is scaled by `decay_factor^k`.
fn score_penalty(mut hits: Vec<SearchHit>, decay_factor: f32) -> Vec<SearchHit> {
    let mut seen: HashMap<DocumentId, i32> = HashMap::new();
    for hit in hits.iter_mut() {
        let k = seen.entry(hit.document_id).or_insert(0);
        hit.score *= decay_factor.powi(*k);
        *k += 1;
    }
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits
}

/// First pass keeps up to `max_per_document` per document, the overflow follows in rank order.
fn cap_then_fill(hits: Vec<SearchHit>, max_per_document: usize) -> Vec<SearchHit> {
    let mut seen: HashMap<DocumentId, usize> = HashMap::new();
    let (mut kept, mut overflow) = (Vec::with_capacity(hits.len()), Vec::new());
    for hit in hits {
        let count = seen.entry(hit.document_id).or_insert(0);
        *count += 1;
        if *count <= max_per_document {
            kept.push(hit);
        } else {
            overflow.push(hit);
        }
    }
    kept.append(&mut overflow);
    kept
}
