//! The retrieval engine: one context object owning every per-collection
//! store, index, and keyword scorer.
//!
//! Construct a [`RetrievalEngine`] once at startup and share it (`Arc`)
//! with the CLI and the knowledge-base manager. Read operations live in
//! [`crate::search`], [`crate::get`], and [`crate::stats`]; this module holds
//! the component registry and the mutating operations.
//!
//! # Locking
//!
//! - [`DocumentStore`] and each [`VectorIndex`](crate::vector_index::VectorIndex)
//!   lock per collection around load-mutate-persist.
//! - Keyword scorers are immutable [`Bm25Index`] values behind `Arc`. A
//!   rebuild lists the store, builds a new scorer, and swaps it in under a
//!   rebuild lock, so a slower rebuild can never replace a newer scorer.
//!   Searches only take the registry read lock and keep reading the
//!   previous scorer until the swap.
//! - Ingest and update check the vector dimension before writing, and undo
//!   the store write if the vector write fails.
//! - Multi-step operations (ingest, update, delete) are not atomic across
//!   steps; a reader may briefly see a document without its vector.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use staged_rag_core::bm25::Bm25Index;
use staged_rag_core::chunk::chunk_text;
use staged_rag_core::models::{count_tokens, Document, DocumentChunk};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embedding::EmbeddingEngine;
use crate::error::{RagError, RagResult};
use crate::store::{lock, DocumentStore};
use crate::summary::{create_summarizer, Summarizer};
use crate::vector_index::IndexRegistry;

pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Collection names become file names, so they are restricted to
/// `[A-Za-z0-9_-]{1,64}`.
pub fn validate_collection(name: &str) -> RagResult<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(RagError::validation(format!(
            "invalid collection name '{}': use 1-64 letters, digits, '_' or '-'",
            name
        )))
    }
}

/// One document to ingest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestRequest {
    pub title: String,
    pub text: String,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Supplied summary; generated when absent or blank.
    #[serde(default)]
    pub summary: Option<String>,
}

fn default_source() -> String {
    "manual".to_string()
}

impl IngestRequest {
    pub fn new(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
            source: default_source(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub doc_id: String,
    pub title: String,
    pub collection: String,
    pub chunk_count: usize,
    pub token_count: usize,
    pub summary: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub title: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchIngestResponse {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<BatchItemResult>,
    pub total_tokens_indexed: usize,
}

/// Fields to replace on an existing document. `None` leaves a field as is;
/// `metadata` is merged key by key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateRequest {
    pub text: Option<String>,
    pub title: Option<String>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<Metadata>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateResponse {
    pub doc_id: String,
    pub status: String,
    pub rechunked: bool,
    pub reembedded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    pub doc_id: String,
    pub deleted: bool,
}

pub struct RetrievalEngine {
    pub(crate) config: Config,
    pub(crate) store: DocumentStore,
    pub(crate) indexes: IndexRegistry,
    pub(crate) keyword: RwLock<HashMap<String, Arc<Bm25Index>>>,
    keyword_rebuild: Mutex<()>,
    pub(crate) embedder: EmbeddingEngine,
    pub(crate) summarizer: Box<dyn Summarizer>,
}

impl RetrievalEngine {
    /// Open storage under the configured directories and build the
    /// configured embedding and summary providers.
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let embedder = EmbeddingEngine::new(&config.embedding);
        let summarizer = create_summarizer(&config.summary);
        Self::with_components(config, embedder, summarizer)
    }

    /// Open storage with explicit providers.
    pub fn with_components(
        config: Config,
        embedder: EmbeddingEngine,
        summarizer: Box<dyn Summarizer>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let store_dir = config.storage.store_dir();
        let index_dir = config.storage.index_dir();
        let store = DocumentStore::open(&store_dir)
            .with_context(|| format!("Failed to open document store: {}", store_dir.display()))?;
        let indexes = IndexRegistry::open(&index_dir)
            .with_context(|| format!("Failed to open index dir: {}", index_dir.display()))?;
        info!(
            store = %store_dir.display(),
            index = %index_dir.display(),
            embedder = embedder.provider_name(),
            summarizer = summarizer.name(),
            "retrieval engine opened"
        );
        Ok(Self {
            config,
            store,
            indexes,
            keyword: RwLock::new(HashMap::new()),
            keyword_rebuild: Mutex::new(()),
            embedder,
            summarizer,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn default_collection(&self) -> &str {
        &self.config.retrieval.default_collection
    }

    pub(crate) fn clamp_top_k(&self, top_k: usize) -> usize {
        top_k.clamp(1, self.config.retrieval.max_top_k)
    }

    // ============ Keyword scorer registry ============

    /// The current keyword scorer for `collection`, built on first use.
    pub(crate) fn keyword_index(&self, collection: &str) -> RagResult<Arc<Bm25Index>> {
        {
            let map = self
                .keyword
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(index) = map.get(collection) {
                return Ok(Arc::clone(index));
            }
        }
        self.rebuild_keyword(collection)
    }

    /// Rebuild the keyword scorer from the store and swap it in.
    pub(crate) fn rebuild_keyword(&self, collection: &str) -> RagResult<Arc<Bm25Index>> {
        let _rebuild = lock(&self.keyword_rebuild);
        let started = Instant::now();
        let docs = self.store.list(collection)?;
        let count = docs.len();
        let index = Arc::new(Bm25Index::build(
            docs.into_iter().map(|d| {
                let text = d.keyword_text();
                (d.doc_id, text)
            }),
        ));
        self.keyword
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(collection.to_string(), Arc::clone(&index));
        debug!(
            collection,
            count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "keyword index rebuilt"
        );
        Ok(index)
    }

    // ============ Helpers ============

    fn chunk(&self, text: &str) -> Vec<DocumentChunk> {
        let c = &self.config.chunking;
        chunk_text(text, c.chunk_size, c.chunk_overlap, c.min_chunk_size)
    }

    fn summary_for(&self, text: &str, supplied: Option<&str>) -> String {
        match supplied {
            Some(s) if !s.trim().is_empty() => s.to_string(),
            _ if self.config.ingestion.auto_summary => self.summarizer.summarize(text),
            _ => String::new(),
        }
    }

    fn check_text(&self, text: &str) -> RagResult<usize> {
        if text.trim().is_empty() {
            return Err(RagError::validation("text must not be empty"));
        }
        let tokens = count_tokens(text);
        let max = self.config.ingestion.max_document_tokens;
        if tokens > max {
            return Err(RagError::capacity(format!(
                "document has {} tokens, limit is {}",
                tokens, max
            )));
        }
        Ok(tokens)
    }

    // ============ Mutations ============

    /// Validate, summarise, chunk, embed, and index one document.
    ///
    /// Nothing is written until every input check has passed.
    pub fn ingest(&self, req: IngestRequest, collection: &str) -> RagResult<IngestResponse> {
        let started = Instant::now();
        validate_collection(collection)?;
        if req.title.trim().is_empty() {
            return Err(RagError::validation("title must not be empty"));
        }
        let token_count = self.check_text(&req.text)?;

        let summary = self.summary_for(&req.text, req.summary.as_deref());
        let chunks = self.chunk(&req.text);
        let now = Utc::now();
        let doc = Document {
            doc_id: uuid::Uuid::new_v4().to_string(),
            title: req.title,
            source: req.source,
            full_text: req.text,
            summary,
            chunks,
            tags: req.tags,
            collection: collection.to_string(),
            token_count,
            created_at: now,
            updated_at: now,
            metadata: req.metadata,
        };
        let vector = self.embedder.embed(doc.embedding_text());

        let response = IngestResponse {
            doc_id: doc.doc_id.clone(),
            title: doc.title.clone(),
            collection: collection.to_string(),
            chunk_count: doc.chunks.len(),
            token_count,
            summary: doc.summary.clone(),
            status: "indexed".to_string(),
        };

        let index = self.indexes.get(collection)?;
        index.check_dimension(vector.len())?;
        self.store.save(collection, doc)?;
        if let Err(e) = index.upsert(&response.doc_id, vector) {
            if let Err(undo) = self.store.delete(collection, &response.doc_id) {
                warn!(collection, doc_id = %response.doc_id, error = %undo, "failed to roll back document");
            }
            return Err(e);
        }
        self.rebuild_keyword(collection)?;

        info!(
            collection,
            doc_id = %response.doc_id,
            chunks = response.chunk_count,
            tokens = token_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "document ingested"
        );
        Ok(response)
    }

    /// Ingest each payload independently. A batch over the configured
    /// maximum is rejected whole before anything is written.
    pub fn batch_ingest(
        &self,
        requests: Vec<IngestRequest>,
        collection: &str,
    ) -> RagResult<BatchIngestResponse> {
        validate_collection(collection)?;
        let max = self.config.ingestion.max_batch_size;
        if requests.len() > max {
            return Err(RagError::capacity(format!(
                "batch of {} documents exceeds limit of {}",
                requests.len(),
                max
            )));
        }

        let total = requests.len();
        let mut results = Vec::with_capacity(total);
        let mut succeeded = 0;
        let mut total_tokens = 0;
        for req in requests {
            let title = req.title.clone();
            match self.ingest(req, collection) {
                Ok(resp) => {
                    succeeded += 1;
                    total_tokens += resp.token_count;
                    results.push(BatchItemResult {
                        title,
                        status: "indexed".to_string(),
                        doc_id: Some(resp.doc_id),
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(collection, title = %title, error = %e, "batch item failed");
                    results.push(BatchItemResult {
                        title,
                        status: "error".to_string(),
                        doc_id: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        Ok(BatchIngestResponse {
            total,
            succeeded,
            failed: total - succeeded,
            results,
            total_tokens_indexed: total_tokens,
        })
    }

    /// Replace fields of an existing document.
    ///
    /// New text re-chunks, re-summarises (unless a summary is supplied),
    /// and re-embeds. A new summary alone re-embeds without re-chunking.
    pub fn update_document(
        &self,
        doc_id: &str,
        collection: &str,
        req: UpdateRequest,
    ) -> RagResult<UpdateResponse> {
        validate_collection(collection)?;
        let current = self
            .store
            .get(collection, doc_id)?
            .ok_or_else(|| RagError::not_found(format!("document not found: {}", doc_id)))?;

        if let Some(title) = &req.title {
            if title.trim().is_empty() {
                return Err(RagError::validation("title must not be empty"));
            }
        }
        let new_text = match req.text {
            Some(text) => {
                self.check_text(&text)?;
                let chunks = self.chunk(&text);
                let summary = self.summary_for(&text, req.summary.as_deref());
                Some((text, chunks, summary))
            }
            None => None,
        };
        let rechunked = new_text.is_some();

        let mut preview = current.clone();
        if let Some(title) = &req.title {
            preview.title = title.clone();
        }
        match &new_text {
            Some((_, _, summary)) => preview.summary = summary.clone(),
            None => {
                if let Some(summary) = &req.summary {
                    preview.summary = summary.clone();
                }
            }
        }
        let reembedded = preview.embedding_text() != current.embedding_text() || rechunked;
        let vector = reembedded.then(|| self.embedder.embed(preview.embedding_text()));
        let keyword_changed = rechunked
            || preview.title != current.title
            || preview.summary != current.summary;

        let index = self.indexes.get(collection)?;
        if let Some(vector) = &vector {
            index.check_dimension(vector.len())?;
        }

        let updated = self.store.update(collection, doc_id, |doc| {
            doc.title = preview.title;
            doc.summary = preview.summary;
            if let Some(tags) = req.tags {
                doc.tags = tags;
            }
            if let Some(meta) = req.metadata {
                doc.metadata.extend(meta);
            }
            if let Some((text, chunks, _)) = new_text {
                doc.replace_text(text, chunks);
            }
            doc.updated_at = Utc::now();
        })?;
        if updated.is_none() {
            return Err(RagError::not_found(format!("document not found: {}", doc_id)));
        }

        if let Some(vector) = vector {
            if let Err(e) = index.upsert(doc_id, vector) {
                if let Err(undo) = self.store.save(collection, current) {
                    warn!(collection, doc_id, error = %undo, "failed to roll back document");
                }
                return Err(e);
            }
        }
        if keyword_changed {
            self.rebuild_keyword(collection)?;
        }

        info!(collection, doc_id, rechunked, reembedded, "document updated");
        Ok(UpdateResponse {
            doc_id: doc_id.to_string(),
            status: "updated".to_string(),
            rechunked,
            reembedded,
        })
    }

    /// Remove a document from the store, vector index, and keyword scorer.
    /// Deleting an unknown id is a no-op reporting `deleted: false`.
    pub fn delete_document(&self, doc_id: &str, collection: &str) -> RagResult<DeleteResponse> {
        validate_collection(collection)?;
        let removed = self.store.delete(collection, doc_id)?.is_some();
        let had_vector = self.indexes.get(collection)?.delete(doc_id)?;
        if removed || had_vector {
            self.rebuild_keyword(collection)?;
        }
        if removed {
            info!(collection, doc_id, "document deleted");
        }
        Ok(DeleteResponse {
            doc_id: doc_id.to_string(),
            deleted: removed,
        })
    }
}
