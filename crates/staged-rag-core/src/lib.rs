//! # Staged RAG Core
//!
//! Shared, I/O-free logic for Staged RAG: the document model, sentence
//! splitting and chunking, vector math, BM25 keyword scoring, and the
//! rank-fusion arithmetic used by hybrid and multi-query search.
//!
//! This crate performs no filesystem or network access. Persistence,
//! embedding providers, and the retrieval engine live in the `staged-rag`
//! crate.

pub mod bm25;
pub mod chunk;
pub mod fusion;
pub mod models;
pub mod text;
pub mod vector;
