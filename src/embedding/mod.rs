//! Embedding providers and the fallback-wrapping engine.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`HashEmbedder`]**: feature-hashed bag of words; offline and
//!   deterministic. The default provider.
//! - **[`OpenAiEmbedder`]**: calls an OpenAI-compatible `/embeddings` endpoint.
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed`.
//!
//! Providers are fallible. [`EmbeddingEngine`] wraps one and never is: it
//! paces requests, retries failures, checks the vector length, and as a
//! last resort returns a deterministic vector derived from the text hash, so
//! ingestion always gets a vector of the configured dimension.
//!
//! # Provider Selection
//!
//! ```rust
//! # use staged_rag::config::EmbeddingConfig;
//! # use staged_rag::embedding::create_embedder;
//! let config = EmbeddingConfig::default(); // provider = "hash"
//! let embedder = create_embedder(&config).unwrap();
//! assert_eq!(embedder.name(), "hash");
//! assert_eq!(embedder.embed("hello world").unwrap().len(), 384);
//! ```
//!
//! # Retry Strategy
//!
//! Each call is attempted `1 + max_retries` times with a fixed
//! `retry_delay_ms` pause between attempts. HTTP 4xx responses other than
//! 429 are not retried.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use staged_rag_core::vector::{deterministic_vector, l2_normalize};
use tracing::{debug, info, warn};

use crate::config::EmbeddingConfig;
use crate::error::{RagError, RagResult};
use crate::store::lock;

/// A text embedding backend.
pub trait Embedder: Send + Sync {
    /// Provider identifier (e.g. `"openai"`).
    fn name(&self) -> &str;
    /// Vector dimensionality this provider is configured for.
    fn dims(&self) -> usize;
    /// Embed one text.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

// ============ Hash Provider ============

/// Offline embedder: hashes each lowercase word into one of `dims` buckets
/// and L2-normalises the counts.
///
/// Texts sharing vocabulary land close together, which is enough for
/// lexical-overlap retrieval without any model.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = Sha256::digest(token.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(bytes) % self.dims as u64) as usize
    }
}

impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.dims == 0 {
            bail!("hash embedder needs dims > 0");
        }
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            v[self.bucket(&token.to_lowercase())] += 1.0;
        }
        l2_normalize(&mut v);
        Ok(v)
    }
}

// ============ HTTP helpers ============

fn http_client(timeout_secs: u64) -> Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Error raised for a non-success HTTP status. `retryable` is false for
/// client errors other than 429.
#[derive(Debug, thiserror::Error)]
#[error("{provider} API error {status}: {body}")]
pub struct HttpStatusError {
    pub provider: &'static str,
    pub status: u16,
    pub body: String,
    pub retryable: bool,
}

fn check_status(
    provider: &'static str,
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(HttpStatusError {
        provider,
        status: status.as_u16(),
        body,
        retryable: status.as_u16() == 429 || status.is_server_error(),
    }
    .into())
}

fn json_floats(value: &serde_json::Value, what: &str) -> Result<Vec<f32>> {
    let arr = value
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("Invalid response: {} is not an array", what))?;
    Ok(arr
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ OpenAI Provider ============

/// Embedder for the OpenAI embeddings API (or any compatible server).
///
/// Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAiEmbedder {
    client: reqwest::blocking::Client,
    api_key: String,
    model: String,
    url: String,
    dims: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            api_key,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            dims: config.dims,
        })
    }
}

impl Embedder for OpenAiEmbedder {
    fn name(&self) -> &str {
        "openai"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        if self.model.starts_with("text-embedding-3") {
            body["dimensions"] = serde_json::json!(self.dims);
        }
        let response = self
            .client
            .post(format!("{}/embeddings", self.url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()?;
        let json: serde_json::Value = check_status("OpenAI", response)?.json()?;
        let first = json
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|d| d.first())
            .and_then(|item| item.get("embedding"))
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data[0].embedding"))?;
        json_floats(first, "embedding")
    }
}

// ============ Ollama Provider ============

/// Embedder backed by a local Ollama instance.
pub struct OllamaEmbedder {
    client: reqwest::blocking::Client,
    model: String,
    url: String,
    dims: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            dims: config.dims,
        })
    }
}

impl Embedder for OllamaEmbedder {
    fn name(&self) -> &str {
        "ollama"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let response = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .map_err(|e| {
                anyhow::anyhow!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url,
                    e
                )
            })?;
        let json: serde_json::Value = check_status("Ollama", response)?.json()?;
        let first = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .and_then(|e| e.first())
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;
        json_floats(first, "embedding")
    }
}

/// Create the [`Embedder`] named by `config.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAiEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Box::new(HashEmbedder::new(config.dims))),
        "openai" => Ok(Box::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Box::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Engine ============

/// Sliding one-minute window request pacer.
struct RateLimiter {
    per_minute: u32,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    const WINDOW: Duration = Duration::from_secs(60);

    fn new(per_minute: u32) -> Self {
        Self {
            per_minute,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    /// Block until another request fits in the window, then record it.
    fn pace(&self) {
        if self.per_minute == 0 {
            return;
        }
        let mut calls = lock(&self.calls);
        let now = Instant::now();
        while calls
            .front()
            .is_some_and(|t| now.duration_since(*t) >= Self::WINDOW)
        {
            calls.pop_front();
        }
        if calls.len() >= self.per_minute as usize {
            if let Some(oldest) = calls.front() {
                let wait = (*oldest + Self::WINDOW).saturating_duration_since(now)
                    + Duration::from_millis(100);
                info!(wait_ms = wait.as_millis() as u64, "embedding rate limit reached, sleeping");
                thread::sleep(wait);
            }
            calls.pop_front();
        }
        calls.push_back(Instant::now());
    }
}

/// Provider wrapper that always yields a vector of the configured dimension.
pub struct EmbeddingEngine {
    provider: Option<Box<dyn Embedder>>,
    dims: usize,
    max_retries: u32,
    retry_delay: Duration,
    limiter: RateLimiter,
}

impl EmbeddingEngine {
    /// Build the configured provider. If it cannot be constructed (missing
    /// API key, bad config) the engine runs in fallback-only mode.
    pub fn new(config: &EmbeddingConfig) -> Self {
        let provider = match create_embedder(config) {
            Ok(p) => {
                info!(provider = p.name(), dims = config.dims, "embedding engine ready");
                Some(p)
            }
            Err(e) => {
                warn!(
                    provider = %config.provider,
                    error = %e,
                    "embedding provider unavailable, using deterministic fallback only"
                );
                None
            }
        };
        Self::from_parts(provider, config)
    }

    /// Wrap an explicit provider (or none) with `config`'s retry and pacing.
    pub fn from_parts(provider: Option<Box<dyn Embedder>>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            dims: config.dims,
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            limiter: RateLimiter::new(config.requests_per_minute),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn provider_name(&self) -> &str {
        self.provider.as_ref().map_or("fallback", |p| p.name())
    }

    pub fn is_fallback_only(&self) -> bool {
        self.provider.is_none()
    }

    /// Ask the provider, with pacing and retries. Fails with
    /// [`RagError::Provider`] when every attempt fails.
    pub fn try_embed(&self, text: &str) -> RagResult<Vec<f32>> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| RagError::Provider("no embedding provider configured".to_string()))?;

        let attempts = self.max_retries + 1;
        let mut last_err = String::new();
        for attempt in 1..=attempts {
            self.limiter.pace();
            match provider.embed(text) {
                Ok(v) if v.len() == self.dims => return Ok(v),
                Ok(v) => {
                    return Err(RagError::Provider(format!(
                        "{} returned {} dims, expected {}",
                        provider.name(),
                        v.len(),
                        self.dims
                    )));
                }
                Err(e) => {
                    let retryable = e
                        .downcast_ref::<HttpStatusError>()
                        .map_or(true, |h| h.retryable);
                    last_err = e.to_string();
                    if !retryable || attempt == attempts {
                        break;
                    }
                    warn!(
                        attempt,
                        attempts,
                        error = %e,
                        "embedding attempt failed, retrying"
                    );
                    thread::sleep(self.retry_delay);
                }
            }
        }
        Err(RagError::Provider(last_err))
    }

    /// Embed `text`, falling back to a deterministic vector on failure.
    pub fn embed(&self, text: &str) -> Vec<f32> {
        if self.provider.is_none() {
            return deterministic_vector(text, self.dims);
        }
        match self.try_embed(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "embedding failed, using deterministic fallback");
                deterministic_vector(text, self.dims)
            }
        }
    }

    pub fn embed_many<'a, I>(&self, texts: I) -> Vec<Vec<f32>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let vectors: Vec<Vec<f32>> = texts.into_iter().map(|t| self.embed(t)).collect();
        debug!(count = vectors.len(), "embedded batch");
        vectors
    }
}
