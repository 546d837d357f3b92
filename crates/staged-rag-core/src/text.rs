//! Sentence splitting, noise cleanup, and extractive summaries.
//!
//! Sentences end at `.`, `!`, or `?` followed by whitespace, or at a blank
//! line. Single newlines inside a paragraph are treated as ordinary
//! whitespace, so hard-wrapped prose reads as one sentence stream.

use std::sync::OnceLock;

use regex::Regex;

/// A sentence located in the original text, as byte offsets.
///
/// `start` is the first non-whitespace byte and `end` is one past the last
/// non-whitespace byte, so `&text[start..end]` is the trimmed sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentenceSpan {
    pub start: usize,
    pub end: usize,
}

impl SentenceSpan {
    /// The sentence with every internal whitespace run collapsed to a
    /// single space.
    pub fn normalized(&self, text: &str) -> String {
        text[self.start..self.end]
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Locate every sentence in `text`.
///
/// Returns an empty vector for blank input.
pub fn sentence_spans(text: &str) -> Vec<SentenceSpan> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    let mut last_end = 0usize;
    let mut prev: Option<char> = None;
    let mut in_gap = false;
    let mut gap_newlines = 0usize;

    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if !in_gap {
                in_gap = true;
                gap_newlines = 0;
            }
            if c == '\n' {
                gap_newlines += 1;
            }
            continue;
        }

        if in_gap {
            if let Some(s) = start {
                let terminal = matches!(prev, Some('.' | '!' | '?'));
                if terminal || gap_newlines >= 2 {
                    spans.push(SentenceSpan { start: s, end: last_end });
                    start = None;
                }
            }
            in_gap = false;
        }

        if start.is_none() {
            start = Some(i);
        }
        last_end = i + c.len_utf8();
        prev = Some(c);
    }

    if let Some(s) = start {
        spans.push(SentenceSpan { start: s, end: last_end });
    }
    spans
}

/// Split `text` into whitespace-normalised sentences.
pub fn split_sentences(text: &str) -> Vec<String> {
    sentence_spans(text)
        .iter()
        .map(|span| span.normalized(text))
        .collect()
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex must compile"))
}

static CAMEL_CASE: OnceLock<Regex> = OnceLock::new();
static UPPER_RUN: OnceLock<Regex> = OnceLock::new();
static LETTER_DIGIT: OnceLock<Regex> = OnceLock::new();
static DIGIT_LETTER: OnceLock<Regex> = OnceLock::new();
static PAGE_NUMBER_LINE: OnceLock<Regex> = OnceLock::new();
static MULTI_NEWLINE: OnceLock<Regex> = OnceLock::new();
static MULTI_SPACE: OnceLock<Regex> = OnceLock::new();
static MONTH_YEAR: OnceLock<Regex> = OnceLock::new();

/// Insert spaces where PDF extraction jammed words together:
/// `SomaliaFloodExposure` → `Somalia Flood Exposure`, `for2024` → `for 2024`.
pub fn split_joined_words(text: &str) -> String {
    let text = regex(&CAMEL_CASE, r"([a-z])([A-Z])").replace_all(text, "$1 $2");
    let text = regex(&UPPER_RUN, r"([A-Z]+)([A-Z][a-z])").replace_all(&text, "$1 $2");
    let text = regex(&LETTER_DIGIT, r"([a-zA-Z])(\d)").replace_all(&text, "$1 $2");
    let text = regex(&DIGIT_LETTER, r"(\d)([a-zA-Z])").replace_all(&text, "$1 $2");
    text.into_owned()
}

/// Python-style `isupper`: at least one cased character and no lowercase.
fn is_upper(s: &str) -> bool {
    let mut cased = false;
    for c in s.chars() {
        if c.is_lowercase() {
            return false;
        }
        if c.is_uppercase() {
            cased = true;
        }
    }
    cased
}

fn is_alpha(s: &str) -> bool {
    !s.is_empty() && s.chars().all(char::is_alphabetic)
}

/// Clean noisy (typically PDF-extracted) text.
///
/// Splits joined words, drops standalone page numbers, collapses runs of
/// newlines and spaces, trims every line, and drops lines shorter than four
/// characters unless they are all caps.
pub fn clean_text(text: &str) -> String {
    let text = split_joined_words(text);
    let text = regex(&PAGE_NUMBER_LINE, r"(?m)^[ \t]*\d+[ \t]*$").replace_all(&text, "");
    let text = regex(&MULTI_NEWLINE, r"\n{3,}").replace_all(&text, "\n\n");
    let text = regex(&MULTI_SPACE, r"[ \t]{3,}").replace_all(&text, " ");

    text.lines()
        .map(str::trim)
        .filter(|line| line.chars().count() >= 4 || is_upper(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

const BOILERPLATE: &[&str] = &[
    "this is a sample document",
    "page-based formatting",
    "showcase page",
    "none of the content has been changed",
];

/// Pick up to `max_sentences` informative sentences, preferring the start
/// of the document.
///
/// Skips sentences with fewer than `min_words` words, mostly non-alphabetic
/// content, all-caps headers, boilerplate, and bare month/year lines. A
/// sentence that opens with a run of all-caps words is salvaged from the
/// first normal-case word when enough words remain. Falls back to any
/// sentence of at least three words when nothing qualifies.
pub fn extract_key_sentences(text: &str, max_sentences: usize, min_words: usize) -> String {
    let cleaned = clean_text(text);
    let sentences = split_sentences(&cleaned);
    let month_year = regex(&MONTH_YEAR, r"^[A-Z]+\s+\d{4}$");

    let mut picked: Vec<String> = Vec::new();
    for sentence in &sentences {
        if picked.len() >= max_sentences {
            break;
        }
        let mut sentence = sentence.clone();
        let words: Vec<&str> = sentence.split_whitespace().collect();
        if words.len() < min_words {
            continue;
        }

        let total = sentence.chars().count().max(1);
        let alpha = sentence.chars().filter(|c| c.is_alphabetic()).count();
        if (alpha as f64) / (total as f64) < 0.5 {
            continue;
        }
        let upper = sentence.chars().filter(|c| c.is_uppercase()).count();
        if (upper as f64) / (alpha.max(1) as f64) > 0.70 && words.len() < 15 {
            continue;
        }

        let lead = &words[..words.len().min(6)];
        if lead.len() >= 5 && lead.iter().all(|w| is_upper(w) || !is_alpha(w)) {
            let normal_start = words.iter().position(|w| {
                w.chars().next().is_some_and(char::is_uppercase)
                    && !is_upper(w)
                    && is_alpha(w)
                    && w.chars().count() > 2
            });
            match normal_start {
                Some(i) if words.len() - i >= min_words => {
                    sentence = words[i..].join(" ");
                }
                Some(_) => {}
                None => continue,
            }
        }

        let lower = sentence.to_lowercase();
        if BOILERPLATE.iter().any(|b| lower.contains(b)) {
            continue;
        }
        if month_year.is_match(sentence.trim()) {
            continue;
        }
        picked.push(sentence);
    }

    if picked.is_empty() {
        return sentences
            .iter()
            .filter(|s| s.split_whitespace().count() >= 3)
            .take(max_sentences)
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string();
    }
    picked.join(" ").trim().to_string()
}
