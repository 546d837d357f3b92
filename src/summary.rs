//! Document summarisers.
//!
//! Summaries are what first-stage search ranks against, so every document
//! needs one. [`Summarizer::summarize`] is infallible: the chat-model
//! summariser falls back to the extractive one on any error.

use std::time::Duration;

use anyhow::{Context, Result};
use staged_rag_core::text::extract_key_sentences;
use tracing::warn;

use crate::config::SummaryConfig;

/// Minimum words for a sentence to count as substantive.
const MIN_SENTENCE_WORDS: usize = 8;

pub trait Summarizer: Send + Sync {
    fn name(&self) -> &str;
    /// A short summary of `text`. Empty for blank input.
    fn summarize(&self, text: &str) -> String;
}

/// Picks the first few informative sentences of the document.
pub struct ExtractiveSummarizer {
    max_sentences: usize,
}

impl ExtractiveSummarizer {
    pub fn new(max_sentences: usize) -> Self {
        Self {
            max_sentences: max_sentences.max(1),
        }
    }
}

impl Summarizer for ExtractiveSummarizer {
    fn name(&self) -> &str {
        "extractive"
    }

    fn summarize(&self, text: &str) -> String {
        let text = text.trim();
        if text.is_empty() {
            return String::new();
        }
        extract_key_sentences(text, self.max_sentences, MIN_SENTENCE_WORDS)
    }
}

/// Summarises with an OpenAI-compatible chat completion endpoint.
pub struct ChatSummarizer {
    client: reqwest::blocking::Client,
    api_key: String,
    model: String,
    url: String,
    fallback: ExtractiveSummarizer,
}

impl ChatSummarizer {
    pub fn new(config: &SummaryConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set")?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            fallback: ExtractiveSummarizer::new(config.max_sentences),
        })
    }

    fn request(&self, text: &str) -> Result<String> {
        let prompt = format!(
            "Summarize the following document in 2-4 sentences, focusing on the key facts and intent.\n\nDOCUMENT:\n{}\n",
            text
        );
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": 0.2,
        });
        let response = self
            .client
            .post(format!("{}/chat/completions", self.url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            anyhow::bail!("chat API error {}: {}", status, body);
        }
        let json: serde_json::Value = response.json()?;
        let content = json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing content"))?;
        Ok(content.trim().to_string())
    }
}

impl Summarizer for ChatSummarizer {
    fn name(&self) -> &str {
        "openai"
    }

    fn summarize(&self, text: &str) -> String {
        let text = text.trim();
        if text.is_empty() {
            return String::new();
        }
        match self.request(text) {
            Ok(summary) if !summary.is_empty() => summary,
            Ok(_) => self.fallback.summarize(text),
            Err(e) => {
                warn!(error = %e, "summary generation failed, using extractive fallback");
                self.fallback.summarize(text)
            }
        }
    }
}

/// Create the summariser named by `config.provider`. A chat summariser that
/// cannot be built degrades to extractive with a warning.
pub fn create_summarizer(config: &SummaryConfig) -> Box<dyn Summarizer> {
    match config.provider.as_str() {
        "openai" => match ChatSummarizer::new(config) {
            Ok(s) => Box::new(s),
            Err(e) => {
                warn!(error = %e, "chat summariser unavailable, using extractive");
                Box::new(ExtractiveSummarizer::new(config.max_sentences))
            }
        },
        _ => Box::new(ExtractiveSummarizer::new(config.max_sentences)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extractive_blank_is_empty() {
        let s = ExtractiveSummarizer::new(3);
        assert_eq!(s.summarize("   "), "");
    }

    #[test]
    fn test_extractive_limits_sentences() {
        let s = ExtractiveSummarizer::new(1);
        let text = "The committee approved the new water treatment budget for the coming year. \
                    Construction will start in the spring once permits have been finalised.";
        let summary = s.summarize(text);
        assert!(summary.starts_with("The committee approved"));
        assert!(!summary.contains("Construction"));
    }

    #[test]
    fn test_factory_defaults_to_extractive() {
        let s = create_summarizer(&SummaryConfig::default());
        assert_eq!(s.name(), "extractive");
    }
}
