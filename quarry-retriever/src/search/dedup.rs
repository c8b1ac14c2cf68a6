use super::types::{AdditionalSource, SearchHit};
use crate::vector::cosine_similarity;

/// Fold near-identical passages from different files into the better-ranked hit.
///
/// A hit is merged when its embedding's cosine similarity with an already kept
/// hit exceeds `threshold` and the two come from different files. The merged
/// hit is listed in the keeper's `additional_sources`. Hits without an
/// embedding are always kept.
pub fn deduplicate(hits: Vec<SearchHit>, threshold: f32) -> Vec<SearchHit> {
    let mut kept: Vec<SearchHit> = Vec::with_capacity(hits.len());

    for hit in hits {
        let duplicate_of = hit.embedding.as_deref().and_then(|embedding| {
            kept.iter().position(|keeper| {
                keeper.file_path != hit.file_path
                    && keeper
                        .embedding
                        .as_deref()
                        .is_some_and(|other| cosine_similarity(embedding, other) > threshold)
            })
        });

        match duplicate_of {
            Some(index) => kept[index].additional_sources.push(AdditionalSource {
                document_id: hit.document_id,
                chunk_id: hit.chunk_id,
                file_path: hit.file_path,
                file_name: hit.file_name,
                score: hit.score,
            }),
            None => kept.push(hit),
        }
    }

    kept
}
