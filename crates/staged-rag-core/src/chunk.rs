//! Sentence-boundary text chunker with token overlap.
//!
//! Splits document text into ordered [`DocumentChunk`]s that respect a
//! `chunk_size` token budget. Splitting happens only between sentences, so
//! a chunk never cuts a sentence in half.
//!
//! # Algorithm
//!
//! 1. Locate sentences in the original text ([`sentence_spans`]).
//! 2. Greedily add sentences to the current chunk until the next one would
//!    push it past `chunk_size` tokens.
//! 3. Close the chunk if it holds at least `min_chunk_size` tokens; otherwise
//!    keep accumulating so no text is dropped.
//! 4. Seed the next chunk with the last `overlap` tokens of the closed one.
//! 5. Whatever remains at the end is emitted even if it is below the minimum.
//!
//! A single sentence longer than `chunk_size` is never truncated; it ends up
//! in an oversized chunk of its own (plus any overlap seed).
//!
//! # Offsets
//!
//! `start_char` / `end_char` are character offsets of the chunk's own
//! sentences in the original text. The overlap seed is excluded, so reported
//! ranges are ordered, never overlap, and the gaps between them contain only
//! whitespace.
//!
//! # Example
//!
//! ```rust
//! use staged_rag_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("Hello world. Second sentence.", 200, 20, 1);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].chunk_index, 0);
//! assert_eq!(chunks[0].start_char, 0);
//! ```

use crate::models::{count_tokens, DocumentChunk};
use crate::text::{sentence_spans, SentenceSpan};

/// Converts monotonically increasing byte offsets into char offsets
/// without rescanning from the start of the text each time.
struct CharCursor<'a> {
    text: &'a str,
    byte: usize,
    chars: usize,
}

impl<'a> CharCursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            byte: 0,
            chars: 0,
        }
    }

    fn advance_to(&mut self, byte: usize) -> usize {
        debug_assert!(byte >= self.byte, "offsets must be monotonic");
        self.chars += self.text[self.byte..byte].chars().count();
        self.byte = byte;
        self.chars
    }
}

fn word_count(s: &str) -> usize {
    s.split_whitespace().count()
}

/// Split `text` into overlapping chunks on sentence boundaries.
///
/// # Arguments
///
/// * `chunk_size`: Soft maximum tokens per chunk.
/// * `overlap`: Tokens from the end of each chunk repeated at the start of
///   the next one.
/// * `min_chunk_size`: Chunks below this are merged forward instead of being
///   emitted, except for the final chunk.
///
/// Returns an empty vector for blank text. Indices are contiguous from 0.
pub fn chunk_text(
    text: &str,
    chunk_size: usize,
    overlap: usize,
    min_chunk_size: usize,
) -> Vec<DocumentChunk> {
    let spans = sentence_spans(text);
    let mut cursor = CharCursor::new(text);
    let mut chunks: Vec<DocumentChunk> = Vec::new();

    let mut seed = String::new();
    let mut current: Vec<(SentenceSpan, String)> = Vec::new();
    let mut current_tokens = 0usize;

    for span in spans {
        let sentence = span.normalized(text);
        let tokens = word_count(&sentence);

        if !current.is_empty() && current_tokens + tokens > chunk_size {
            let chunk_text = assemble(&seed, &current);
            if count_tokens(&chunk_text) >= min_chunk_size {
                seed = tail_tokens(&chunk_text, overlap);
                push_chunk(&mut chunks, &mut cursor, chunk_text, &current);
                current.clear();
                current_tokens = word_count(&seed);
            }
        }

        current.push((span, sentence));
        current_tokens += tokens;
    }

    if !current.is_empty() {
        let chunk_text = assemble(&seed, &current);
        push_chunk(&mut chunks, &mut cursor, chunk_text, &current);
    }

    chunks
}

fn assemble(seed: &str, sentences: &[(SentenceSpan, String)]) -> String {
    let mut out = String::from(seed);
    for (_, sentence) in sentences {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(sentence);
    }
    out
}

fn tail_tokens(text: &str, n: usize) -> String {
    if n == 0 {
        return String::new();
    }
    let words: Vec<&str> = text.split_whitespace().collect();
    let skip = words.len().saturating_sub(n);
    words[skip..].join(" ")
}

fn push_chunk(
    chunks: &mut Vec<DocumentChunk>,
    cursor: &mut CharCursor<'_>,
    text: String,
    sentences: &[(SentenceSpan, String)],
) {
    let (first, last) = match (sentences.first(), sentences.last()) {
        (Some((first, _)), Some((last, _))) => (*first, *last),
        _ => return,
    };
    let start_char = cursor.advance_to(first.start);
    let end_char = cursor.advance_to(last.end);
    chunks.push(DocumentChunk {
        chunk_index: chunks.len(),
        token_count: count_tokens(&text),
        text,
        start_char,
        end_char,
    });
}
