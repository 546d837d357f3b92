//! Okapi BM25 keyword scoring over an in-memory corpus.
//!
//! The index is immutable once built. Callers rebuild it from the document
//! store after every mutation and swap it in whole.
//!
//! Scoring uses the usual Okapi form with `k1 = 1.5` and `b = 0.75`.
//! Terms that occur in more than half the corpus would get a negative IDF;
//! those are floored at `epsilon × mean IDF` (`epsilon = 0.25`) so common
//! words still contribute a small positive amount.

use std::collections::HashMap;

pub const K1: f64 = 1.5;
pub const B: f64 = 0.75;
pub const EPSILON: f64 = 0.25;

/// Lowercase and split on whitespace.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

struct Entry {
    id: String,
    term_freqs: HashMap<String, u32>,
    len: usize,
}

/// A BM25 index over a fixed set of documents.
pub struct Bm25Index {
    entries: Vec<Entry>,
    idf: HashMap<String, f64>,
    avg_len: f64,
}

impl Bm25Index {
    /// An index with no documents. Every query scores to an empty list.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            idf: HashMap::new(),
            avg_len: 0.0,
        }
    }

    /// Build from `(id, text)` pairs. Order is preserved in score output.
    pub fn build<I>(docs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut entries = Vec::new();
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        let mut total_len = 0usize;

        for (id, text) in docs {
            let tokens = tokenize(&text);
            let mut term_freqs: HashMap<String, u32> = HashMap::new();
            for t in &tokens {
                *term_freqs.entry(t.clone()).or_insert(0) += 1;
            }
            for term in term_freqs.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            total_len += tokens.len();
            entries.push(Entry {
                id,
                term_freqs,
                len: tokens.len(),
            });
        }

        if entries.is_empty() {
            return Self::empty();
        }

        let n = entries.len() as f64;
        let mut idf = HashMap::with_capacity(doc_freq.len());
        let mut idf_sum = 0.0;
        let mut negative = Vec::new();
        for (term, freq) in doc_freq {
            let f = freq as f64;
            let value = ((n - f + 0.5) / (f + 0.5)).ln();
            idf_sum += value;
            if value < 0.0 {
                negative.push(term.clone());
            }
            idf.insert(term, value);
        }
        if !idf.is_empty() {
            let floor = EPSILON * idf_sum / idf.len() as f64;
            for term in negative {
                idf.insert(term, floor);
            }
        }

        Self {
            avg_len: total_len as f64 / n,
            entries,
            idf,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Score every document against `query`, in build order.
    pub fn score(&self, query: &str) -> Vec<(String, f64)> {
        let terms = tokenize(query);
        let avg_len = if self.avg_len > 0.0 { self.avg_len } else { 1.0 };

        self.entries
            .iter()
            .map(|entry| {
                let norm = K1 * (1.0 - B + B * entry.len as f64 / avg_len);
                let score = terms
                    .iter()
                    .map(|term| {
                        let tf = entry.term_freqs.get(term).copied().unwrap_or(0) as f64;
                        let idf = self.idf.get(term).copied().unwrap_or(0.0);
                        idf * (tf * (K1 + 1.0)) / (tf + norm)
                    })
                    .sum();
                (entry.id.clone(), score)
            })
            .collect()
    }

    /// Scores sorted descending, ties kept in build order.
    pub fn ranked(&self, query: &str) -> Vec<(String, f64)> {
        let mut scored = self.score(query);
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Bm25Index {
        Bm25Index::build(vec![
            ("a".to_string(), "rust borrow checker ownership".to_string()),
            ("b".to_string(), "python garbage collector".to_string()),
            ("c".to_string(), "rust async runtime tokio".to_string()),
            ("d".to_string(), "gardening tips for spring".to_string()),
        ])
    }

    #[test]
    fn test_empty_index_scores_nothing() {
        let idx = Bm25Index::build(Vec::<(String, String)>::new());
        assert!(idx.is_empty());
        assert!(idx.score("anything").is_empty());
    }

    #[test]
    fn test_every_document_gets_a_score() {
        let idx = corpus();
        let scores = idx.score("ownership");
        assert_eq!(scores.len(), 4);
        assert_eq!(scores[0].0, "a");
    }

    #[test]
    fn test_rare_term_ranks_its_document_first() {
        let idx = corpus();
        let ranked = idx.ranked("ownership");
        assert_eq!(ranked[0].0, "a");
        assert!(ranked[0].1 > 0.0);
        assert_eq!(ranked[1].1, 0.0);
    }

    #[test]
    fn test_case_insensitive() {
        let idx = corpus();
        let lower = idx.score("tokio");
        let upper = idx.score("TOKIO");
        assert_eq!(lower, upper);
    }

    #[test]
    fn test_common_term_gets_positive_floor() {
        // "shared" is in 3 of 4 docs, so its raw IDF is negative.
        let idx = Bm25Index::build(vec![
            ("a".to_string(), "shared alpha".to_string()),
            ("b".to_string(), "shared beta".to_string()),
            ("c".to_string(), "shared gamma".to_string()),
            ("d".to_string(), "delta".to_string()),
        ]);
        let ranked = idx.ranked("shared");
        assert!(ranked[0].1 > 0.0);
        let d = ranked.iter().find(|(id, _)| id == "d").unwrap();
        assert_eq!(d.1, 0.0);
    }

    #[test]
    fn test_unknown_terms_score_zero() {
        let idx = corpus();
        assert!(idx.score("zebra").iter().all(|(_, s)| *s == 0.0));
    }

    #[test]
    fn test_ties_keep_build_order() {
        let idx = corpus();
        let ranked = idx.ranked("zebra");
        let ids: Vec<&str> = ranked.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }
}
