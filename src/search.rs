//! Stage-one retrieval: ranked summaries, never full text.
//!
//! Four entry points share the same building block, [`RetrievalEngine::search_summaries`]:
//!
//! | Operation | Signal |
//! |-----------|--------|
//! | `search_summaries` | cosine similarity of query vs. summary vectors |
//! | `find_similar` | a stored document's own vector as the query |
//! | `multi_query_search` | several queries, fused with RRF or max |
//! | `hybrid_search` | weighted semantic + max-normalised BM25 |
//!
//! `explain_retrieval` breaks the signals down for a set of documents.
//!
//! All scores are clamped into `[0, 1]` before filtering or fusion. Sorting is
//! stable, so equal scores keep the vector index's insertion order.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use serde::Serialize;
use staged_rag_core::bm25::tokenize;
use staged_rag_core::fusion::{clamp_unit, fuse, hybrid_combine, FusionMethod};
use staged_rag_core::models::Document;
use staged_rag_core::vector::cosine_similarity;
use tracing::debug;

use crate::error::{RagError, RagResult};
use crate::service::{validate_collection, RetrievalEngine};

/// One ranked summary.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryResult {
    pub doc_id: String,
    pub title: String,
    pub summary: String,
    pub similarity_score: f64,
    pub token_count: usize,
    pub tags: Vec<String>,
    pub collection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_score: Option<f64>,
}

impl SummaryResult {
    fn from_doc(doc: &Document, score: f64) -> Self {
        Self {
            doc_id: doc.doc_id.clone(),
            title: doc.title.clone(),
            summary: doc.summary.clone(),
            similarity_score: score,
            token_count: doc.token_count,
            tags: doc.tags.clone(),
            collection: doc.collection.clone(),
            semantic_score: None,
            keyword_score: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SummaryResult>,
    pub total_candidates: usize,
    pub search_time_ms: u64,
}

impl SearchResponse {
    fn empty(query: &str) -> Self {
        Self {
            query: query.to_string(),
            results: Vec::new(),
            total_candidates: 0,
            search_time_ms: 0,
        }
    }
}

/// Per-document breakdown of the retrieval signals for one query.
#[derive(Debug, Clone, Serialize)]
pub struct Explanation {
    pub doc_id: String,
    pub title: String,
    pub cosine_similarity: f64,
    pub bm25_score: f64,
    pub query_doc_term_overlap: f64,
    pub top_matching_terms: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExplainResponse {
    pub query: String,
    pub collection: String,
    pub explanations: Vec<Explanation>,
    /// Requested ids with no document in the collection.
    pub missing: Vec<String>,
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

impl RetrievalEngine {
    /// Rank document summaries by similarity to `query`.
    ///
    /// `top_k` is clamped to `[1, max_top_k]`. An empty collection or a
    /// blank query yields no results rather than an error.
    pub fn search_summaries(
        &self,
        query: &str,
        top_k: usize,
        collection: &str,
        min_score: f64,
        tags_filter: Option<&[String]>,
    ) -> RagResult<SearchResponse> {
        validate_collection(collection)?;
        if query.trim().is_empty() {
            return Ok(SearchResponse::empty(query));
        }
        let started = Instant::now();
        let top_k = self.clamp_top_k(top_k);
        let index = self.indexes.get(collection)?;
        let total_candidates = self.store.count(collection)?;
        if index.is_empty() {
            return Ok(SearchResponse::empty(query));
        }

        let vector = self.embedder.embed(query);
        let hits = index.search(&vector, top_k)?;
        let tags = tags_filter.filter(|t| !t.is_empty());

        let mut results = Vec::with_capacity(hits.len());
        for (doc_id, raw) in hits {
            let score = clamp_unit(raw as f64);
            if score < min_score {
                continue;
            }
            let Some(doc) = self.store.get(collection, &doc_id)? else {
                continue;
            };
            if let Some(wanted) = tags {
                if !doc.has_any_tag(wanted) {
                    continue;
                }
            }
            results.push(SummaryResult::from_doc(&doc, score));
        }

        debug!(
            collection,
            results = results.len(),
            elapsed_ms = elapsed_ms(started),
            "summary search"
        );
        Ok(SearchResponse {
            query: query.to_string(),
            results,
            total_candidates,
            search_time_ms: elapsed_ms(started),
        })
    }

    /// Documents whose summaries resemble `doc_id`'s.
    ///
    /// Uses the stored vector when present, otherwise re-embeds the
    /// document's summary (or title).
    pub fn find_similar(
        &self,
        doc_id: &str,
        top_k: usize,
        exclude_same_source: bool,
        collection: &str,
    ) -> RagResult<SearchResponse> {
        validate_collection(collection)?;
        let started = Instant::now();
        let target = self
            .store
            .get(collection, doc_id)?
            .ok_or_else(|| RagError::not_found(format!("document not found: {}", doc_id)))?;
        let top_k = self.clamp_top_k(top_k);
        let index = self.indexes.get(collection)?;
        let vector = index
            .get(doc_id)
            .unwrap_or_else(|| self.embedder.embed(target.embedding_text()));

        let mut results = Vec::new();
        for (id, raw) in index.search(&vector, top_k + 1)? {
            if id == doc_id {
                continue;
            }
            let Some(doc) = self.store.get(collection, &id)? else {
                continue;
            };
            if exclude_same_source && doc.source == target.source {
                continue;
            }
            results.push(SummaryResult::from_doc(&doc, clamp_unit(raw as f64)));
            if results.len() == top_k {
                break;
            }
        }

        Ok(SearchResponse {
            query: format!("similar:{}", doc_id),
            results,
            total_candidates: self.store.count(collection)?,
            search_time_ms: elapsed_ms(started),
        })
    }

    /// Run each query through [`search_summaries`](Self::search_summaries)
    /// and fuse the rankings.
    pub fn multi_query_search(
        &self,
        queries: &[String],
        top_k: usize,
        collection: &str,
        method: FusionMethod,
    ) -> RagResult<SearchResponse> {
        validate_collection(collection)?;
        let started = Instant::now();
        let top_k = self.clamp_top_k(top_k);
        let min_score = self.config.retrieval.min_similarity_score;

        let mut lists = Vec::with_capacity(queries.len());
        let mut seen: HashMap<String, SummaryResult> = HashMap::new();
        for query in queries {
            let response = self.search_summaries(query, top_k, collection, min_score, None)?;
            let mut list = Vec::with_capacity(response.results.len());
            for result in response.results {
                list.push((result.doc_id.clone(), result.similarity_score));
                seen.entry(result.doc_id.clone()).or_insert(result);
            }
            lists.push(list);
        }

        let results = fuse(&lists, method)
            .into_iter()
            .take(top_k)
            .filter_map(|(id, score)| {
                seen.remove(&id).map(|mut r| {
                    r.similarity_score = score;
                    r
                })
            })
            .collect();

        debug!(
            collection,
            queries = queries.len(),
            method = method.as_str(),
            elapsed_ms = elapsed_ms(started),
            "multi-query search"
        );
        Ok(SearchResponse {
            query: queries.join("; "),
            results,
            total_candidates: self.store.count(collection)?,
            search_time_ms: elapsed_ms(started),
        })
    }

    /// Weighted blend of semantic similarity and BM25.
    ///
    /// Weights are normalised to sum to one. Documents found by either
    /// signal are candidates, so a purely lexical match can still rank.
    pub fn hybrid_search(
        &self,
        query: &str,
        top_k: usize,
        collection: &str,
        semantic_weight: f64,
        keyword_weight: f64,
    ) -> RagResult<SearchResponse> {
        validate_collection(collection)?;
        if query.trim().is_empty() {
            return Ok(SearchResponse::empty(query));
        }
        let started = Instant::now();
        let top_k = self.clamp_top_k(top_k);
        let min_score = self.config.retrieval.min_similarity_score;

        let semantic: Vec<(String, f64)> = self
            .search_summaries(query, top_k, collection, min_score, None)?
            .results
            .into_iter()
            .map(|r| (r.doc_id, r.similarity_score))
            .collect();
        let keyword = self.keyword_index(collection)?.score(query);

        let mut results = Vec::new();
        for scored in hybrid_combine(&semantic, &keyword, semantic_weight, keyword_weight) {
            if results.len() == top_k {
                break;
            }
            let Some(doc) = self.store.get(collection, &scored.doc_id)? else {
                continue;
            };
            let mut result = SummaryResult::from_doc(&doc, scored.score);
            result.semantic_score = Some(scored.semantic);
            result.keyword_score = Some(scored.keyword);
            results.push(result);
        }

        debug!(
            collection,
            results = results.len(),
            elapsed_ms = elapsed_ms(started),
            "hybrid search"
        );
        Ok(SearchResponse {
            query: query.to_string(),
            results,
            total_candidates: self.store.count(collection)?,
            search_time_ms: elapsed_ms(started),
        })
    }

    /// Show how each signal scores `doc_ids` against `query`.
    pub fn explain_retrieval(
        &self,
        query: &str,
        doc_ids: &[String],
        collection: &str,
    ) -> RagResult<ExplainResponse> {
        validate_collection(collection)?;
        if query.trim().is_empty() {
            return Err(RagError::validation("query must not be empty"));
        }
        let query_vector = self.embedder.embed(query);
        let bm25: HashMap<String, f64> = self
            .keyword_index(collection)?
            .score(query)
            .into_iter()
            .collect();
        let index = self.indexes.get(collection)?;
        let query_terms: BTreeSet<String> = tokenize(query).into_iter().collect();

        let mut explanations = Vec::new();
        let mut missing = Vec::new();
        for doc_id in doc_ids {
            let Some(doc) = self.store.get(collection, doc_id)? else {
                missing.push(doc_id.clone());
                continue;
            };
            let doc_vector = index
                .get(doc_id)
                .unwrap_or_else(|| self.embedder.embed(doc.embedding_text()));
            let summary_terms: BTreeSet<String> =
                tokenize(&format!("{} {}", doc.title, doc.summary))
                    .into_iter()
                    .collect();
            let matching: Vec<String> = query_terms.intersection(&summary_terms).cloned().collect();
            let overlap = if query_terms.is_empty() {
                0.0
            } else {
                matching.len() as f64 / query_terms.len() as f64
            };
            explanations.push(Explanation {
                doc_id: doc_id.clone(),
                title: doc.title,
                cosine_similarity: cosine_similarity(&query_vector, &doc_vector) as f64,
                bm25_score: bm25.get(doc_id).copied().unwrap_or(0.0),
                query_doc_term_overlap: overlap,
                top_matching_terms: matching.into_iter().take(10).collect(),
            });
        }

        Ok(ExplainResponse {
            query: query.to_string(),
            collection: collection.to_string(),
            explanations,
            missing,
        })
    }
}
