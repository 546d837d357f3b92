//! Core data models shared by the store, index, and retrieval engine.
//!
//! A [`Document`] carries both the cheap summary used for first-stage
//! ranking and the full text plus pre-computed [`DocumentChunk`]s used when
//! a caller expands a result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Count whitespace-delimited tokens in `text`.
///
/// Never returns zero: an empty or blank string counts as one token so that
/// averages and ratios downstream never divide by zero.
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count().max(1)
}

/// A contiguous slice of a document's text.
///
/// `start_char` / `end_char` are character (not byte) offsets into the
/// original full text. Offsets cover only the chunk's own sentences; the
/// overlap prefix carried over from the previous chunk is not counted, so
/// reported ranges never overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub chunk_index: usize,
    pub text: String,
    pub token_count: usize,
    pub start_char: usize,
    pub end_char: usize,
}

/// A stored document record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub title: String,
    /// Origin path, URL, or free-form label.
    pub source: String,
    pub full_text: String,
    /// Short summary used for first-stage retrieval.
    pub summary: String,
    #[serde(default)]
    pub chunks: Vec<DocumentChunk>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub collection: String,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    /// Replace the full text together with its chunks and token count.
    ///
    /// The only way the engine mutates text, so `token_count` and `chunks`
    /// can never go stale relative to `full_text`.
    pub fn replace_text(&mut self, text: String, chunks: Vec<DocumentChunk>) {
        self.token_count = count_tokens(&text);
        self.full_text = text;
        self.chunks = chunks;
        self.updated_at = Utc::now();
    }

    /// Text fed to the keyword scorer: title, summary, and body.
    pub fn keyword_text(&self) -> String {
        format!("{} {} {}", self.title, self.summary, self.full_text)
    }

    /// Text embedded into the vector index: the summary, or the title when
    /// there is no summary.
    pub fn embedding_text(&self) -> &str {
        if self.summary.trim().is_empty() {
            &self.title
        } else {
            &self.summary
        }
    }

    /// True if any of `wanted` appears in this document's tags.
    pub fn has_any_tag(&self, wanted: &[String]) -> bool {
        wanted.iter().any(|t| self.tags.contains(t))
    }
}
