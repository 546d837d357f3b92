//! Rank fusion for multi-query and hybrid retrieval.
//!
//! # Multi-query fusion
//!
//! Each query produces its own ranked list. Lists are combined either by
//! Reciprocal Rank Fusion (`Σ 1 / (k + rank + 1)`, 0-based rank, over the
//! lists a document appears in) or by taking the maximum similarity seen.
//!
//! # Hybrid fusion
//!
//! 1. Clamp both weights to `>= 0` and normalise them to sum to 1. If both
//!    are zero, use semantic 1 / keyword 0.
//! 2. Divide raw BM25 scores by the largest one (all zero if it is zero).
//! 3. Clamp semantic and keyword signals into `[0, 1]`.
//! 4. `score = w_sem × semantic + w_kw × keyword` over the union of both
//!    candidate sets.
//!
//! All outputs are sorted by score descending. Ties keep first-seen order,
//! so results are deterministic for a given input.

use serde::Serialize;
use std::collections::HashMap;

/// Standard RRF damping constant.
pub const RRF_K: f64 = 60.0;

/// How multi-query rankings are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FusionMethod {
    #[default]
    Rrf,
    Max,
}

impl FusionMethod {
    /// Parse a method name. Anything other than `"max"` means RRF.
    pub fn parse(name: &str) -> Self {
        if name.eq_ignore_ascii_case("max") {
            FusionMethod::Max
        } else {
            FusionMethod::Rrf
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FusionMethod::Rrf => "rrf",
            FusionMethod::Max => "max",
        }
    }
}

/// Clamp into `[0, 1]`. NaN maps to 0.
pub fn clamp_unit(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

/// Accumulates per-document scores while remembering first-seen order.
struct Accumulator {
    order: Vec<String>,
    scores: HashMap<String, f64>,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            scores: HashMap::new(),
        }
    }

    fn update(&mut self, id: &str, f: impl FnOnce(Option<f64>) -> f64) {
        match self.scores.get_mut(id) {
            Some(score) => *score = f(Some(*score)),
            None => {
                self.order.push(id.to_string());
                self.scores.insert(id.to_string(), f(None));
            }
        }
    }

    fn into_ranked(self) -> Vec<(String, f64)> {
        let Accumulator { order, scores } = self;
        let mut ranked: Vec<(String, f64)> = order
            .into_iter()
            .map(|id| {
                let s = scores.get(&id).copied().unwrap_or(0.0);
                (id, s)
            })
            .collect();
        sort_desc(&mut ranked);
        ranked
    }
}

/// Stable sort by score descending.
pub fn sort_desc(items: &mut [(String, f64)]) {
    items.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
}

/// Reciprocal Rank Fusion over ranked lists of `(id, score)`.
///
/// Only rank positions matter; the scores in the input are ignored.
pub fn reciprocal_rank_fusion(lists: &[Vec<(String, f64)>], k: f64) -> Vec<(String, f64)> {
    let mut acc = Accumulator::new();
    for list in lists {
        for (rank, (id, _)) in list.iter().enumerate() {
            let contribution = 1.0 / (k + rank as f64 + 1.0);
            acc.update(id, |prev| prev.unwrap_or(0.0) + contribution);
        }
    }
    acc.into_ranked()
}

/// Keep each document's best score across all lists.
pub fn max_fusion(lists: &[Vec<(String, f64)>]) -> Vec<(String, f64)> {
    let mut acc = Accumulator::new();
    for list in lists {
        for (id, score) in list {
            let score = *score;
            acc.update(id, |prev| prev.map_or(score, |p| p.max(score)));
        }
    }
    acc.into_ranked()
}

/// Fuse multi-query rankings with the given method.
pub fn fuse(lists: &[Vec<(String, f64)>], method: FusionMethod) -> Vec<(String, f64)> {
    match method {
        FusionMethod::Rrf => reciprocal_rank_fusion(lists, RRF_K),
        FusionMethod::Max => max_fusion(lists),
    }
}

/// Normalise hybrid weights to sum to 1.
pub fn normalize_weights(semantic: f64, keyword: f64) -> (f64, f64) {
    let semantic = if semantic.is_nan() { 0.0 } else { semantic.max(0.0) };
    let keyword = if keyword.is_nan() { 0.0 } else { keyword.max(0.0) };
    let sum = semantic + keyword;
    if sum <= 0.0 {
        return (1.0, 0.0);
    }
    (semantic / sum, keyword / sum)
}

/// One fused hybrid result with both component signals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HybridScore {
    pub doc_id: String,
    pub score: f64,
    pub semantic: f64,
    pub keyword: f64,
}

/// Combine semantic similarities with raw BM25 scores.
///
/// `semantic` is expected in rank order; documents found only by the keyword
/// signal are appended after it, in `keyword` order, before sorting.
pub fn hybrid_combine(
    semantic: &[(String, f64)],
    keyword: &[(String, f64)],
    semantic_weight: f64,
    keyword_weight: f64,
) -> Vec<HybridScore> {
    let (w_sem, w_kw) = normalize_weights(semantic_weight, keyword_weight);

    let max_kw = keyword.iter().map(|(_, s)| *s).fold(0.0_f64, f64::max);
    let kw_map: HashMap<&str, f64> = keyword
        .iter()
        .map(|(id, s)| {
            let norm = if max_kw > 0.0 { s / max_kw } else { 0.0 };
            (id.as_str(), clamp_unit(norm))
        })
        .collect();
    let sem_map: HashMap<&str, f64> = semantic
        .iter()
        .map(|(id, s)| (id.as_str(), clamp_unit(*s)))
        .collect();

    let mut seen: HashMap<&str, ()> = HashMap::new();
    let mut out: Vec<HybridScore> = Vec::new();
    for id in semantic.iter().chain(keyword.iter()).map(|(id, _)| id.as_str()) {
        if seen.insert(id, ()).is_some() {
            continue;
        }
        let s = sem_map.get(id).copied().unwrap_or(0.0);
        let k = kw_map.get(id).copied().unwrap_or(0.0);
        out.push(HybridScore {
            doc_id: id.to_string(),
            score: w_sem * s + w_kw * k,
            semantic: s,
            keyword: k,
        });
    }

    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    out
}
