use std::sync::Arc;

use staged_rag::config::Config;
use staged_rag::embedding::EmbeddingEngine;
use staged_rag::service::IngestRequest;
use staged_rag::summary::ExtractiveSummarizer;
use staged_rag::vector_index::VectorIndex;
use staged_rag::{FusionMethod, RetrievalEngine};
use staged_rag_core::chunk::chunk_text;
use staged_rag_core::models::count_tokens;
use tempfile::TempDir;

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = tmp.path().join("data");
    config.embedding.dims = 128;
    config.embedding.retry_delay_ms = 0;
    config.chunking.chunk_size = 30;
    config.chunking.chunk_overlap = 5;
    config.chunking.min_chunk_size = 8;
    config
}

fn open_engine(tmp: &TempDir) -> RetrievalEngine {
    let config = test_config(tmp);
    let embedder = EmbeddingEngine::new(&config.embedding);
    RetrievalEngine::with_components(config, embedder, Box::new(ExtractiveSummarizer::new(3)))
        .unwrap()
}

const DOCS: &[(&str, &str)] = &[
    (
        "Kubernetes Rollouts",
        "Kubernetes deployments roll out new pods gradually behind the service. \
         A failed readiness probe pauses the rollout until an operator intervenes. \
         Rolling back restores the previous replica set within a few seconds.",
    ),
    (
        "Postgres Backups",
        "Nightly Postgres backups are written to object storage with a seven day retention. \
         Point in time recovery replays the write ahead log from the last base backup. \
         Restores should be rehearsed every quarter on a staging database.",
    ),
    (
        "Incident Review",
        "Every production incident gets a blameless review within five working days. \
         The review records the timeline, the contributing factors, and follow up actions. \
         Action items are tracked on the reliability board until they are closed.",
    ),
    (
        "Kafka Retention",
        "Kafka topics keep messages for seven days unless compaction is enabled. \
         Consumers that fall behind the retention window lose messages permanently. \
         Lag alerts fire when a consumer group trails by more than one hour.",
    ),
];

fn ingest_all(engine: &RetrievalEngine) -> Vec<String> {
    DOCS.iter()
        .map(|(title, text)| {
            engine
                .ingest(IngestRequest::new(*title, *text), "default")
                .unwrap()
                .doc_id
        })
        .collect()
}

#[test]
fn test_empty_collection_search_is_not_an_error() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp);
    for query in ["backups", "", "anything at all"] {
        let resp = engine.search_summaries(query, 5, "fresh", 0.0, None).unwrap();
        assert!(resp.results.is_empty());
        assert_eq!(resp.total_candidates, 0);
    }
}

#[test]
fn test_chunks_cover_text_and_respect_minimum() {
    let text: String = DOCS.iter().map(|(_, t)| *t).collect::<Vec<_>>().join("\n\n");
    let chunks = chunk_text(&text, 30, 5, 8);
    assert!(chunks.len() > 1);

    let chars: Vec<char> = text.chars().collect();
    assert_eq!(chunks[0].start_char, 0);
    for pair in chunks.windows(2) {
        let gap: String = chars[pair[0].end_char..pair[1].start_char].iter().collect();
        assert!(gap.trim().is_empty(), "gap {:?} is not whitespace", gap);
    }
    assert_eq!(
        chars[chunks.last().unwrap().end_char..].iter().collect::<String>().trim(),
        ""
    );
    for chunk in &chunks[..chunks.len() - 1] {
        assert!(chunk.token_count >= 8);
    }
}

#[test]
fn test_vector_index_round_trip() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("index.json");
    let v = vec![0.3, -0.2, 0.9, 0.1];
    VectorIndex::open(&path).unwrap().upsert("doc-1", v.clone()).unwrap();

    let reloaded = VectorIndex::open(&path).unwrap();
    let hits = reloaded.search(&v, 1).unwrap();
    assert_eq!(hits[0].0, "doc-1");
    assert!((hits[0].1 - 1.0).abs() < 1e-5);
}

#[test]
fn test_delete_is_idempotent_and_cascades() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp);
    let ids = ingest_all(&engine);

    let first = engine.delete_document(&ids[1], "default").unwrap();
    assert!(first.deleted);
    let second = engine.delete_document(&ids[1], "default").unwrap();
    assert!(!second.deleted);

    let resp = engine
        .search_summaries("postgres backups recovery", 10, "default", 0.0, None)
        .unwrap();
    assert!(resp.results.iter().all(|r| r.doc_id != ids[1]));
    let hybrid = engine
        .hybrid_search("postgres backups recovery", 10, "default", 0.0, 1.0)
        .unwrap();
    assert!(hybrid.results.iter().all(|r| r.doc_id != ids[1]));
    assert_eq!(engine.collection_stats("default").unwrap().document_count, 3);
}

#[test]
fn test_hybrid_with_semantic_weight_only_matches_semantic() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp);
    ingest_all(&engine);

    for query in ["rollout readiness probe", "seven day retention", "review timeline"] {
        let semantic: Vec<String> = engine
            .search_summaries(query, 3, "default", 0.0, None)
            .unwrap()
            .results
            .into_iter()
            .map(|r| r.doc_id)
            .collect();
        let hybrid: Vec<String> = engine
            .hybrid_search(query, 3, "default", 1.0, 0.0)
            .unwrap()
            .results
            .into_iter()
            .map(|r| r.doc_id)
            .collect();
        assert_eq!(semantic, hybrid, "query {:?}", query);
    }
}

#[test]
fn test_multi_query_max_fusion_keeps_best_score() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp);
    ingest_all(&engine);
    let queries = vec!["kafka consumer lag".to_string(), "blameless incident review".to_string()];

    let fused = engine
        .multi_query_search(&queries, 4, "default", FusionMethod::Max)
        .unwrap();
    for result in &fused.results {
        let best = queries
            .iter()
            .map(|q| {
                engine
                    .search_summaries(q, 4, "default", 0.0, None)
                    .unwrap()
                    .results
                    .into_iter()
                    .find(|r| r.doc_id == result.doc_id)
                    .map(|r| r.similarity_score)
                    .unwrap_or(0.0)
            })
            .fold(0.0_f64, f64::max);
        assert!((result.similarity_score - best).abs() < 1e-9);
    }
}

#[test]
fn test_chunk_selector_errors() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp);
    let ids = ingest_all(&engine);

    let total = engine
        .get_document_chunk(&ids[0], "default", Some(0), None)
        .unwrap()
        .total_chunks;
    let err = engine
        .get_document_chunk(&ids[0], "default", Some(total), None)
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
    let err = engine
        .get_document_chunk(&ids[0], "default", None, None)
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
    assert_eq!(err.to_response()["kind"], "validation");
}

#[test]
fn test_collections_are_isolated() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp);
    let id = engine
        .ingest(IngestRequest::new(DOCS[0].0, DOCS[0].1), "ops")
        .unwrap()
        .doc_id;

    assert!(engine.get_document_metadata(&id, "default").is_err());
    assert!(engine
        .search_summaries("kubernetes", 5, "default", 0.0, None)
        .unwrap()
        .results
        .is_empty());
    assert_eq!(engine.get_document_metadata(&id, "ops").unwrap().title, DOCS[0].0);
    assert!(engine.ingest(IngestRequest::new("x", "y"), "../escape").is_err());
}

#[test]
fn test_state_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let id = {
        let engine = open_engine(&tmp);
        ingest_all(&engine);
        engine
            .ingest(IngestRequest::new("Extra", DOCS[2].1), "default")
            .unwrap()
            .doc_id
    };

    let engine = Arc::new(open_engine(&tmp));
    let meta = engine.get_document_metadata(&id, "default").unwrap();
    assert_eq!(meta.token_count, count_tokens(DOCS[2].1));
    let resp = engine.hybrid_search("blameless review", 5, "default", 0.5, 0.5).unwrap();
    assert!(!resp.results.is_empty());
    assert_eq!(engine.collection_stats("default").unwrap().document_count, 5);
}
