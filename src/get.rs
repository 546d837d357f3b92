//! Stage-two retrieval: full text, single chunks, and metadata.
//!
//! Callers reach here after [`crate::search`] has told them which documents
//! are worth expanding. Used by the `srag get` and `srag chunk` commands.

use serde::Serialize;
use staged_rag_core::models::{Document, DocumentChunk};
use staged_rag_core::vector::cosine_similarity;

use crate::error::{RagError, RagResult};
use crate::service::{validate_collection, Metadata, RetrievalEngine};

/// A full document as returned by [`RetrievalEngine::get_documents`].
#[derive(Debug, Clone, Serialize)]
pub struct DocumentResponse {
    pub doc_id: String,
    pub title: String,
    pub source: String,
    pub full_text: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub token_count: usize,
    pub chunk_count: usize,
    pub created_at: String, // RFC 3339
    pub updated_at: String, // RFC 3339
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<DocumentChunk>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentsResponse {
    pub documents: Vec<DocumentResponse>,
    pub total_tokens: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkResponse {
    pub doc_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub text: String,
    pub token_count: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub has_previous: bool,
    pub has_next: bool,
    /// Set in query mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<f64>,
}

/// Everything about a document except its text.
#[derive(Debug, Clone, Serialize)]
pub struct MetadataResponse {
    pub doc_id: String,
    pub title: String,
    pub source: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub collection: String,
    pub token_count: usize,
    pub chunk_count: usize,
    pub created_at: String,
    pub updated_at: String,
    pub metadata: Metadata,
}

impl RetrievalEngine {
    fn require_document(&self, doc_id: &str, collection: &str) -> RagResult<Document> {
        validate_collection(collection)?;
        self.store
            .get(collection, doc_id)?
            .ok_or_else(|| RagError::not_found(format!("document not found: {}", doc_id)))
    }

    /// Fetch full documents. Unknown ids are skipped.
    pub fn get_documents(
        &self,
        doc_ids: &[String],
        collection: &str,
        include_chunks: bool,
    ) -> RagResult<DocumentsResponse> {
        validate_collection(collection)?;
        let mut documents = Vec::with_capacity(doc_ids.len());
        let mut total_tokens = 0;
        for id in doc_ids {
            let Some(doc) = self.store.get(collection, id)? else {
                continue;
            };
            total_tokens += doc.token_count;
            documents.push(DocumentResponse {
                chunk_count: doc.chunks.len(),
                created_at: doc.created_at.to_rfc3339(),
                updated_at: doc.updated_at.to_rfc3339(),
                chunks: include_chunks.then(|| doc.chunks.clone()),
                doc_id: doc.doc_id,
                title: doc.title,
                source: doc.source,
                full_text: doc.full_text,
                summary: doc.summary,
                tags: doc.tags,
                token_count: doc.token_count,
                metadata: doc.metadata,
            });
        }
        Ok(DocumentsResponse {
            documents,
            total_tokens,
        })
    }

    /// One chunk, selected by position or by similarity to `chunk_query`.
    /// The index wins when both are given.
    pub fn get_document_chunk(
        &self,
        doc_id: &str,
        collection: &str,
        chunk_index: Option<usize>,
        chunk_query: Option<&str>,
    ) -> RagResult<ChunkResponse> {
        let doc = self.require_document(doc_id, collection)?;
        let total = doc.chunks.len();

        let (index, relevance) = match (chunk_index, chunk_query) {
            (Some(i), _) => {
                if i >= total {
                    return Err(RagError::validation(format!(
                        "chunk_index {} out of range: document has {} chunks",
                        i, total
                    )));
                }
                (i, None)
            }
            (None, Some(query)) if !query.trim().is_empty() => {
                if total == 0 {
                    return Err(RagError::validation("document has no chunks"));
                }
                let query_vector = self.embedder.embed(query);
                let chunk_vectors = self
                    .embedder
                    .embed_many(doc.chunks.iter().map(|c| c.text.as_str()));
                let mut best = (0, f32::NEG_INFINITY);
                for (i, v) in chunk_vectors.iter().enumerate() {
                    let score = cosine_similarity(&query_vector, v);
                    if score > best.1 {
                        best = (i, score);
                    }
                }
                (best.0, Some(best.1 as f64))
            }
            _ => {
                return Err(RagError::validation(
                    "either chunk_index or chunk_query is required",
                ))
            }
        };

        let chunk = &doc.chunks[index];
        Ok(ChunkResponse {
            doc_id: doc.doc_id.clone(),
            chunk_index: index,
            total_chunks: total,
            text: chunk.text.clone(),
            token_count: chunk.token_count,
            start_char: chunk.start_char,
            end_char: chunk.end_char,
            has_previous: index > 0,
            has_next: index + 1 < total,
            relevance_score: relevance,
        })
    }

    pub fn get_document_metadata(
        &self,
        doc_id: &str,
        collection: &str,
    ) -> RagResult<MetadataResponse> {
        let doc = self.require_document(doc_id, collection)?;
        Ok(MetadataResponse {
            chunk_count: doc.chunks.len(),
            created_at: doc.created_at.to_rfc3339(),
            updated_at: doc.updated_at.to_rfc3339(),
            doc_id: doc.doc_id,
            title: doc.title,
            source: doc.source,
            summary: doc.summary,
            tags: doc.tags,
            collection: doc.collection,
            token_count: doc.token_count,
            metadata: doc.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::service::tests::{engine, RUST_TEXT, SOUP_TEXT};
    use crate::service::IngestRequest;
    use tempfile::TempDir;

    fn long_text() -> String {
        format!("{} {} {}", RUST_TEXT, SOUP_TEXT, RUST_TEXT)
    }

    #[test]
    fn test_get_documents_skips_unknown() {
        let tmp = TempDir::new().unwrap();
        let e = engine(&tmp);
        let id = e.ingest(IngestRequest::new("Rust", RUST_TEXT), "default").unwrap().doc_id;
        let resp = e
            .get_documents(&[id.clone(), "ghost".into()], "default", false)
            .unwrap();
        assert_eq!(resp.documents.len(), 1);
        assert_eq!(resp.documents[0].full_text, RUST_TEXT);
        assert!(resp.documents[0].chunks.is_none());
        assert_eq!(resp.total_tokens, resp.documents[0].token_count);

        let resp = e.get_documents(&[id], "default", true).unwrap();
        assert!(resp.documents[0].chunks.is_some());
    }

    #[test]
    fn test_chunk_by_index() {
        let tmp = TempDir::new().unwrap();
        let e = engine(&tmp);
        let id = e.ingest(IngestRequest::new("Long", long_text()), "default").unwrap().doc_id;
        let first = e.get_document_chunk(&id, "default", Some(0), None).unwrap();
        assert!(first.total_chunks > 1);
        assert!(!first.has_previous);
        assert!(first.has_next);
        assert!(first.relevance_score.is_none());

        let last = e
            .get_document_chunk(&id, "default", Some(first.total_chunks - 1), None)
            .unwrap();
        assert!(last.has_previous);
        assert!(!last.has_next);
    }

    #[test]
    fn test_chunk_errors() {
        let tmp = TempDir::new().unwrap();
        let e = engine(&tmp);
        let id = e.ingest(IngestRequest::new("Rust", RUST_TEXT), "default").unwrap().doc_id;

        let err = e.get_document_chunk(&id, "default", Some(99), None).unwrap_err();
        assert_eq!(err.kind(), "validation");
        let err = e.get_document_chunk(&id, "default", None, None).unwrap_err();
        assert_eq!(err.kind(), "validation");
        let err = e.get_document_chunk("ghost", "default", Some(0), None).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_chunk_by_query_finds_best_match() {
        let tmp = TempDir::new().unwrap();
        let e = engine(&tmp);
        let id = e.ingest(IngestRequest::new("Long", long_text()), "default").unwrap().doc_id;
        let chunk = e
            .get_document_chunk(&id, "default", None, Some("tomato soup garlic basil"))
            .unwrap();
        assert!(chunk.text.contains("Tomato"));
        let score = chunk.relevance_score.unwrap();
        assert!(score > 0.0 && score <= 1.0 + 1e-6);
    }

    #[test]
    fn test_metadata_has_no_text() {
        let tmp = TempDir::new().unwrap();
        let e = engine(&tmp);
        let id = e.ingest(IngestRequest::new("Rust", RUST_TEXT), "default").unwrap().doc_id;
        let meta = e.get_document_metadata(&id, "default").unwrap();
        assert_eq!(meta.title, "Rust");
        assert!(meta.chunk_count >= 1);
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("full_text").is_none());
    }
}
