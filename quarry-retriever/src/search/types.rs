use crate::config::SearchConfig;
use crate::error::{Error, Result};
use crate::storage::{ChunkId, DocumentId, MatchType, RawHit, SearchFilters};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which retrieval primitives a query uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    /// Keyword and semantic results fused with reciprocal rank fusion
    #[default]
    Hybrid,
    Semantic,
    Keyword,
}

impl SearchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStrategy::Hybrid => "hybrid",
            SearchStrategy::Semantic => "semantic",
            SearchStrategy::Keyword => "keyword",
        }
    }
}

impl fmt::Display for SearchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hybrid" => Ok(SearchStrategy::Hybrid),
            "semantic" => Ok(SearchStrategy::Semantic),
            "keyword" => Ok(SearchStrategy::Keyword),
            other => Err(Error::configuration(
                "query.strategy",
                format!("unknown strategy '{other}', expected one of: hybrid, semantic, keyword"),
            )),
        }
    }
}

/// How results from the same document are spread out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiversityMode {
    None,
    /// Multiply each further passage of a document by `decay_factor^k`
    #[default]
    ScorePenalty,
    /// At most `max_per_document` per document first, the rest afterwards
    CapThenFill,
}

impl FromStr for DiversityMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(DiversityMode::None),
            "score_penalty" => Ok(DiversityMode::ScorePenalty),
            "cap_then_fill" => Ok(DiversityMode::CapThenFill),
            other => Err(Error::configuration(
                "query.diversity",
                format!("unknown diversity mode '{other}', expected one of: none, score_penalty, cap_then_fill"),
            )),
        }
    }
}

/// A search request.
///
/// Build one with [`SearchQuery::new`] for the stock defaults or
/// [`SearchEngine::query`](super::SearchEngine::query) for the configured ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    pub query: String,
    pub strategy: SearchStrategy,
    pub filters: SearchFilters,
    pub limit: usize,
    pub offset: usize,
    pub diversity: DiversityMode,
    pub decay_factor: f32,
    pub max_per_document: usize,
    pub dedup: bool,
    pub dedup_threshold: f32,
    /// Return this document's chunks in order instead of ranking
    pub document_id: Option<DocumentId>,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self::from_config("", &SearchConfig::default())
    }
}

impl SearchQuery {
    pub fn new<S: Into<String>>(query: S) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn from_config<S: Into<String>>(query: S, config: &SearchConfig) -> Self {
        Self {
            query: query.into(),
            strategy: SearchStrategy::Hybrid,
            filters: SearchFilters::default(),
            limit: config.limit,
            offset: 0,
            diversity: config.diversity,
            decay_factor: config.decay_factor,
            max_per_document: config.max_per_document,
            dedup: config.dedup,
            dedup_threshold: config.dedup_threshold,
            document_id: None,
        }
    }

    pub fn with_strategy(self, strategy: SearchStrategy) -> Self {
        Self { strategy, ..self }
    }

    pub fn with_filters(self, filters: SearchFilters) -> Self {
        Self { filters, ..self }
    }

    pub fn with_limit(self, limit: usize) -> Self {
        Self { limit, ..self }
    }

    pub fn with_offset(self, offset: usize) -> Self {
        Self { offset, ..self }
    }

    pub fn with_diversity(self, diversity: DiversityMode) -> Self {
        Self { diversity, ..self }
    }

    pub fn with_decay_factor(self, decay_factor: f32) -> Self {
        Self { decay_factor, ..self }
    }

    pub fn with_max_per_document(self, max_per_document: usize) -> Self {
        Self {
            max_per_document,
            ..self
        }
    }

    pub fn with_dedup(self, dedup: bool) -> Self {
        Self { dedup, ..self }
    }

    pub fn with_dedup_threshold(self, dedup_threshold: f32) -> Self {
        Self {
            dedup_threshold,
            ..self
        }
    }

    pub fn with_document_id(self, document_id: DocumentId) -> Self {
        Self {
            document_id: Some(document_id),
            ..self
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_query_ranges(
            "query",
            self.limit,
            self.decay_factor,
            self.max_per_document,
            self.dedup_threshold,
        )
    }
}

pub const DECAY_FACTOR_RANGE: (f32, f32) = (0.5, 1.0);
pub const DEDUP_THRESHOLD_RANGE: (f32, f32) = (0.9, 1.0);

/// Range checks shared by queries and the `[search]` defaults; `prefix` names the table.
pub fn check_query_ranges(
    prefix: &str,
    limit: usize,
    decay_factor: f32,
    max_per_document: usize,
    dedup_threshold: f32,
) -> Result<()> {
    if limit == 0 {
        return Err(Error::configuration(format!("{prefix}.limit"), "must be at least 1"));
    }
    let (low, high) = DECAY_FACTOR_RANGE;
    if !(low..=high).contains(&decay_factor) {
        return Err(Error::configuration(
            format!("{prefix}.decay_factor"),
            format!("must be between {low} and {high}, got {decay_factor}"),
        ));
    }
    if max_per_document == 0 {
        return Err(Error::configuration(format!("{prefix}.max_per_document"), "must be at least 1"));
    }
    let (low, high) = DEDUP_THRESHOLD_RANGE;
    if !(low..=high).contains(&dedup_threshold) {
        return Err(Error::configuration(
            format!("{prefix}.dedup_threshold"),
            format!("must be between {low} and {high}, got {dedup_threshold}"),
        ));
    }
    Ok(())
}

/// Location details of a hit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HitMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

/// A near-duplicate passage from another file, folded into a kept hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditionalSource {
    pub document_id: DocumentId,
    pub chunk_id: ChunkId,
    pub file_path: String,
    pub file_name: String,
    pub score: f32,
}

/// One ranked passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub document_id: DocumentId,
    pub chunk_id: ChunkId,
    pub file_path: String,
    pub file_name: String,
    pub chunk_text: String,
    pub score: f32,
    pub match_type: MatchType,
    pub highlights: Vec<String>,
    pub metadata: HitMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_sources: Vec<AdditionalSource>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl From<RawHit> for SearchHit {
    fn from(hit: RawHit) -> Self {
        Self {
            document_id: hit.document_id,
            chunk_id: hit.chunk_id,
            file_path: hit.file_path,
            file_name: hit.file_name,
            chunk_text: hit.text,
            score: hit.score,
            match_type: hit.match_type,
            highlights: hit.highlights,
            metadata: HitMetadata {
                page: hit.page,
                section: hit.section,
            },
            additional_sources: Vec::new(),
            embedding: hit.embedding,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    /// Candidates gathered before dedup, diversity and pagination
    pub total_candidates: usize,
    /// The strategy actually used, after any fallback
    pub strategy: SearchStrategy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_defaults() {
        let query = SearchQuery::new("rust");
        assert_eq!(query.strategy, SearchStrategy::Hybrid);
        assert_eq!(query.limit, 10);
        assert_eq!(query.diversity, DiversityMode::ScorePenalty);
        assert_eq!(query.decay_factor, 0.85);
        assert_eq!(query.max_per_document, 5);
        assert!(query.dedup);
        assert_eq!(query.dedup_threshold, 0.97);
        assert!(query.validate().is_ok());
    }

    #[test]
    fn test_range_errors_name_the_field() {
        let cases = [
            (SearchQuery::new("q").with_decay_factor(0.49), "query.decay_factor"),
            (SearchQuery::new("q").with_decay_factor(1.01), "query.decay_factor"),
            (SearchQuery::new("q").with_dedup_threshold(0.5), "query.dedup_threshold"),
            (SearchQuery::new("q").with_max_per_document(0), "query.max_per_document"),
            (SearchQuery::new("q").with_limit(0), "query.limit"),
        ];
        for (query, field) in cases {
            match query.validate() {
                Err(Error::Configuration(err)) => assert_eq!(err.field, field),
                other => panic!("expected configuration error for {field}, got {other:?}"),
            }
        }
        assert!(SearchQuery::new("q").with_decay_factor(0.5).validate().is_ok());
        assert!(SearchQuery::new("q").with_dedup_threshold(1.0).validate().is_ok());
    }

    #[test]
    fn test_query_from_json() {
        let query: SearchQuery =
            serde_json::from_str(r#"{"query": "tax", "strategy": "keyword", "diversity": "cap_then_fill"}"#).unwrap();
        assert_eq!(query.strategy, SearchStrategy::Keyword);
        assert_eq!(query.diversity, DiversityMode::CapThenFill);
        assert_eq!(query.limit, 10);
        assert!("vector".parse::<SearchStrategy>().is_err());
    }

    #[test]
    fn test_additional_sources_omitted_when_empty() {
        let hit = SearchHit {
            document_id: 1,
            chunk_id: 2,
            file_path: "/a".into(),
            file_name: "a".into(),
            chunk_text: "text".into(),
            score: 1.0,
            match_type: MatchType::Keyword,
            highlights: vec![],
            metadata: HitMetadata::default(),
            additional_sources: vec![],
            embedding: Some(vec![1.0]),
        };
        let json = serde_json::to_value(&hit).unwrap();
        assert!(json.get("additional_sources").is_none());
        assert!(json.get("embedding").is_none());
        assert_eq!(json["match_type"], "keyword");
    }
}
