//! Collection statistics and listing.
//!
//! A quick summary of what's indexed: document and token counts, chunk
//! counts, tag and source breakdowns, and the vector index's size on disk.
//! Used by `srag stats` and `srag collections`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::RagResult;
use crate::service::{validate_collection, RetrievalEngine};

#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    pub collection: String,
    pub document_count: usize,
    pub total_tokens: usize,
    pub avg_tokens_per_doc: f64,
    pub total_chunks: usize,
    pub tag_distribution: BTreeMap<String, usize>,
    pub source_distribution: BTreeMap<String, usize>,
    pub oldest_document: Option<DateTime<Utc>>,
    pub newest_document: Option<DateTime<Utc>>,
    pub index_size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub document_count: usize,
    pub total_tokens: usize,
}

impl RetrievalEngine {
    pub fn collection_stats(&self, collection: &str) -> RagResult<CollectionStats> {
        validate_collection(collection)?;
        let docs = self.store.list(collection)?;

        let mut tag_distribution = BTreeMap::new();
        let mut source_distribution = BTreeMap::new();
        let mut total_tokens = 0;
        let mut total_chunks = 0;
        for doc in &docs {
            total_tokens += doc.token_count;
            total_chunks += doc.chunks.len();
            for tag in &doc.tags {
                *tag_distribution.entry(tag.clone()).or_insert(0) += 1;
            }
            *source_distribution.entry(doc.source.clone()).or_insert(0) += 1;
        }
        let avg_tokens_per_doc = if docs.is_empty() {
            0.0
        } else {
            total_tokens as f64 / docs.len() as f64
        };

        Ok(CollectionStats {
            collection: collection.to_string(),
            document_count: docs.len(),
            total_tokens,
            avg_tokens_per_doc,
            total_chunks,
            tag_distribution,
            source_distribution,
            oldest_document: docs.iter().map(|d| d.created_at).min(),
            newest_document: docs.iter().map(|d| d.created_at).max(),
            index_size_bytes: self.indexes.get(collection)?.file_size(),
        })
    }

    /// Every collection with a store file. Reports the default collection
    /// (empty) when nothing has been ingested yet.
    pub fn list_collections(&self) -> RagResult<Vec<CollectionInfo>> {
        let mut names = self.store.collections()?;
        if names.is_empty() {
            names.push(self.default_collection().to_string());
        }
        names
            .into_iter()
            .map(|name| {
                let docs = self.store.list(&name)?;
                Ok(CollectionInfo {
                    document_count: docs.len(),
                    total_tokens: docs.iter().map(|d| d.token_count).sum(),
                    name,
                })
            })
            .collect()
    }
}
