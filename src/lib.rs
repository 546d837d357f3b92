//! # Staged RAG
//!
//! A staged document-retrieval engine. Documents are stored with a short
//! summary and split into overlapping chunks; retrieval first ranks the
//! cheap summaries, then lets a caller expand only the documents (or the
//! single chunk) it actually needs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────┐   ┌──────────────────┐
//! │ KnowledgeBase│──▶│  RetrievalEngine  │──▶│ DocumentStore    │
//! │ watcher +    │   │ ingest / search / │   │ VectorIndex      │
//! │ manifest     │   │ get / stats       │   │ BM25 (in memory) │
//! └──────────────┘   └─────────┬─────────┘   └──────────────────┘
//!                              │
//!                      ┌───────┴───────┐
//!                      ▼               ▼
//!                 ┌──────────┐   ┌────────────┐
//!                 │ Embedder │   │ Summarizer │
//!                 └──────────┘   └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! srag ingest ./notes/deploy.md --tags ops
//! srag search "rollback procedure"
//! srag chunk <doc_id> --query "database migration"
//! srag kb watch
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Engine error taxonomy |
//! | [`service`] | `RetrievalEngine`, ingest/update/delete |
//! | [`search`] | Summary, similar, multi-query, and hybrid search |
//! | [`get`] | Full documents, chunks, metadata |
//! | [`stats`] | Collection statistics |
//! | [`store`] | JSON document store |
//! | [`vector_index`] | Persisted brute-force vector index |
//! | [`embedding`] | Embedding providers with fallback |
//! | [`summary`] | Extractive and chat-model summarisers |
//! | [`extract`] | PDF/DOCX/plain-text extraction |
//! | [`watcher`] | Polling file watcher |
//! | [`manifest`] | Knowledge-base manifest |
//! | [`kb`] | Folder-to-collection reconciliation |
//! | [`logging`] | `tracing` subscriber setup |

pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod get;
pub mod kb;
pub mod logging;
pub mod manifest;
pub mod search;
pub mod service;
pub mod stats;
pub mod store;
pub mod summary;
pub mod vector_index;
pub mod watcher;

pub use error::{RagError, RagResult};
pub use service::RetrievalEngine;
pub use staged_rag_core::fusion::FusionMethod;
