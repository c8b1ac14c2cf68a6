use super::dedup::deduplicate;
use super::diversity::apply_diversity;
use super::fusion::{reciprocal_rank_fusion, single_source};
use super::types::{HitMetadata, SearchHit, SearchQuery, SearchResponse, SearchStrategy};
use crate::config::SearchConfig;
use crate::error::{Error, Result};
use crate::storage::{DocumentId, MatchType, RawHit, StorageAdapter};
use quarry_embed::Embedder;
use std::sync::Arc;
use tracing::{debug, warn};

/// Runs queries against a store, optionally with an embedder for semantic retrieval.
pub struct SearchEngine {
    store: Arc<dyn StorageAdapter>,
    embedder: Option<Arc<dyn Embedder>>,
    config: SearchConfig,
}

impl SearchEngine {
    pub fn new(store: Arc<dyn StorageAdapter>, config: SearchConfig) -> Self {
        Self {
            store,
            embedder: None,
            config,
        }
    }

    pub fn with_embedder(self, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder: Some(embedder),
            ..self
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StorageAdapter> {
        &self.store
    }

    /// A query carrying this engine's configured defaults.
    pub fn query<S: Into<String>>(&self, text: S) -> SearchQuery {
        SearchQuery::from_config(text, &self.config)
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResponse> {
        query.validate()?;

        if let Some(document_id) = query.document_id {
            return self.document_chunks(document_id, query).await;
        }

        let strategy = self.effective_strategy(query.strategy)?;
        let window = query.limit.saturating_add(query.offset);
        let fetch = window.max(window.saturating_mul(self.config.candidate_multiplier));

        if query.query.trim().is_empty() {
            return Ok(SearchResponse {
                results: Vec::new(),
                total_candidates: 0,
                strategy,
            });
        }

        let candidates = match strategy {
            SearchStrategy::Keyword => single_source(
                self.store
                    .search_keyword(&query.query, &query.filters, fetch)
                    .await?,
            ),
            SearchStrategy::Semantic => single_source(self.semantic(query, fetch).await?),
            SearchStrategy::Hybrid => {
                let (keyword, semantic) = futures::try_join!(
                    self.store.search_keyword(&query.query, &query.filters, fetch),
                    self.semantic(query, fetch),
                )?;
                reciprocal_rank_fusion(keyword, semantic, self.config.rrf_k)
            }
        };

        let total_candidates = candidates.len();
        debug!(strategy = %strategy, total_candidates, fetch, "gathered search candidates");

        Ok(SearchResponse {
            results: shape(candidates, query),
            total_candidates,
            strategy,
        })
    }

    fn effective_strategy(&self, requested: SearchStrategy) -> Result<SearchStrategy> {
        match (requested, self.embedder.is_some()) {
            (SearchStrategy::Hybrid, false) => {
                warn!("no embedder configured, falling back to keyword search");
                Ok(SearchStrategy::Keyword)
            }
            (SearchStrategy::Semantic, false) => Err(Error::configuration(
                "embedding.executor",
                "semantic search needs an embedder",
            )),
            (strategy, _) => Ok(strategy),
        }
    }

    async fn semantic(&self, query: &SearchQuery, fetch: usize) -> Result<Vec<RawHit>> {
        let Some(embedder) = &self.embedder else {
            return Ok(Vec::new());
        };
        if !embedder.is_ready() {
            embedder.initialize(None).await?;
        }
        let vector = embedder.embed_query(&query.query).await?;
        self.store.search_semantic(&vector, &query.filters, fetch).await
    }

    async fn document_chunks(&self, document_id: DocumentId, query: &SearchQuery) -> Result<SearchResponse> {
        let Some(document) = self.store.get_document(document_id).await? else {
            return Ok(SearchResponse {
                results: Vec::new(),
                total_candidates: 0,
                strategy: query.strategy,
            });
        };

        let chunks = self.store.get_chunks(document_id).await?;
        let total_candidates = chunks.len();
        let results = chunks
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .map(|chunk| SearchHit {
                document_id,
                chunk_id: chunk.id,
                file_path: document.file_path.clone(),
                file_name: document.file_name.clone(),
                chunk_text: chunk.text,
                score: 1.0,
                match_type: MatchType::Document,
                highlights: Vec::new(),
                metadata: HitMetadata {
                    page: chunk.page,
                    section: chunk.section,
                },
                additional_sources: Vec::new(),
                embedding: None,
            })
            .collect();

        Ok(SearchResponse {
            results,
            total_candidates,
            strategy: query.strategy,
        })
    }
}

/// Dedup, then diversity, then the `offset`/`limit` window.
pub(crate) fn shape(candidates: Vec<SearchHit>, query: &SearchQuery) -> Vec<SearchHit> {
    let candidates = if query.dedup {
        deduplicate(candidates, query.dedup_threshold)
    } else {
        candidates
    };
    apply_diversity(candidates, query.diversity, query.decay_factor, query.max_per_document)
        .into_iter()
        .skip(query.offset)
        .take(query.limit)
        .collect()
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::search::{DiversityMode, test_hit};
    use crate::storage::sqlite_store::SqliteStore;
    use crate::storage::options::SqliteOptions;
    use crate::storage::{NewChunk, NewDocument};
    use quarry_embed::{EmbedConfig, ThreadEmbedder};
    use tracing_test::traced_test;

    const DIMS: usize = 384;

    async fn store() -> anyhow::Result<Arc<SqliteStore>> {
        let store = Arc::new(SqliteStore::in_memory(SqliteOptions::default(), DIMS));
        store.initialize().await?;
        Ok(store)
    }

    async fn add_document(
        store: &SqliteStore,
        embedder: Option<&ThreadEmbedder>,
        path: &str,
        passages: &[&str],
    ) -> anyhow::Result<DocumentId> {
        let document = store
            .create_document(NewDocument::from_path(path, format!("hash-{path}"), passages.join("").len() as i64))
            .await?;
        let mut chunks = Vec::new();
        for (index, text) in passages.iter().enumerate() {
            let embedding = match embedder {
                Some(embedder) => Some(embedder.embed_document(text).await?),
                None => None,
            };
            chunks.push(NewChunk {
                chunk_index: index as i64,
                text: text.to_string(),
                embedding,
                ..Default::default()
            });
        }
        store.create_chunks(document.id, chunks).await?;
        Ok(document.id)
    }

    #[test]
    fn test_pagination_window() {
        let candidates: Vec<SearchHit> = (0..12).map(|i| test_hit(i, i, 1.0 - i as f32 * 0.01)).collect();
        let query = SearchQuery::new("q")
            .with_limit(5)
            .with_offset(5)
            .with_diversity(DiversityMode::None)
            .with_dedup(false);

        let page = shape(candidates, &query);
        assert_eq!(page.iter().map(|h| h.chunk_id).collect::<Vec<_>>(), vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_offset_past_end_is_empty() {
        let candidates: Vec<SearchHit> = (0..3).map(|i| test_hit(i, i, 1.0)).collect();
        let query = SearchQuery::new("q").with_offset(10);
        assert!(shape(candidates, &query).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_query_rejected_before_storage() -> anyhow::Result<()> {
        // Never initialized: a storage call would fail with NotInitialized instead
        let store = Arc::new(SqliteStore::in_memory(SqliteOptions::default(), DIMS));
        let engine = SearchEngine::new(store, SearchConfig::default());

        let err = engine
            .search(&SearchQuery::new("tax").with_decay_factor(0.2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(ref e) if e.field == "query.decay_factor"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_hybrid_without_embedder_falls_back_to_keyword() -> anyhow::Result<()> {
        let store = store().await?;
        add_document(&store, None, "/notes/tax.txt", &["quarterly tax filing deadline", "lunch menu"]).await?;
        let engine = SearchEngine::new(store, SearchConfig::default());

        let response = engine.search(&engine.query("tax deadline")).await?;
        assert_eq!(response.strategy, SearchStrategy::Keyword);
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].match_type, MatchType::Keyword);
        assert_eq!(response.results[0].file_name, "tax.txt");
        assert!(logs_contain("falling back to keyword"));
        Ok(())
    }

    #[tokio::test]
    async fn test_semantic_without_embedder_is_configuration_error() -> anyhow::Result<()> {
        let engine = SearchEngine::new(store().await?, SearchConfig::default());
        let err = engine
            .search(&engine.query("anything").with_strategy(SearchStrategy::Semantic))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_hybrid_search_tags_shared_hits() -> anyhow::Result<()> {
        let store = store().await?;
        let embedder = Arc::new(ThreadEmbedder::new(EmbedConfig::hashing()));
        embedder.initialize(None).await?;

        add_document(
            &store,
            Some(embedder.as_ref()),
            "/reports/q3.txt",
            &["revenue growth was strong in the third quarter", "office plants need water"],
        )
        .await?;
        add_document(&store, Some(embedder.as_ref()), "/reports/hr.txt", &["hiring plan for engineers"]).await?;

        let engine = SearchEngine::new(store, SearchConfig::default()).with_embedder(embedder.clone());
        let response = engine.search(&engine.query("revenue growth")).await?;

        assert_eq!(response.strategy, SearchStrategy::Hybrid);
        assert!(response.total_candidates >= 1);
        let top = &response.results[0];
        assert_eq!(top.file_path, "/reports/q3.txt");
        assert_eq!(top.match_type, MatchType::Hybrid);
        assert!(top.highlights.iter().any(|h| h.contains("<mark>")));

        embedder.dispose().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_document_mode_returns_chunks_in_order() -> anyhow::Result<()> {
        let store = store().await?;
        let id = add_document(&store, None, "/a/long.md", &["one", "two", "three", "four"]).await?;
        let engine = SearchEngine::new(store, SearchConfig::default());

        let response = engine
            .search(&engine.query("").with_document_id(id).with_offset(1).with_limit(2))
            .await?;
        assert_eq!(response.total_candidates, 4);
        let texts: Vec<_> = response.results.iter().map(|h| h.chunk_text.as_str()).collect();
        assert_eq!(texts, vec!["two", "three"]);
        assert!(response.results.iter().all(|h| h.match_type == MatchType::Document && h.score == 1.0));

        let missing = engine.search(&engine.query("").with_document_id(id + 100)).await?;
        assert!(missing.results.is_empty());
        Ok(())
    }
}
