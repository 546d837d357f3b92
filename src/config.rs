//! TOML configuration.
//!
//! Every section and every field has a default, so an empty file (or no
//! file at all via [`Config::default`]) is a valid configuration.
//! [`load_config`] reads, parses, and validates.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub summary: SummaryConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub ingestion: IngestionConfig,
    pub knowledge_base: KnowledgeBaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub store_dir: Option<PathBuf>,
    pub index_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            store_dir: None,
            index_dir: None,
        }
    }
}

impl StorageConfig {
    pub fn store_dir(&self) -> PathBuf {
        self.store_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("store"))
    }

    pub fn index_dir(&self) -> PathBuf {
        self.index_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("index"))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `hash`, `openai`, or `ollama`.
    pub provider: String,
    pub model: Option<String>,
    pub dims: usize,
    /// Base URL override for HTTP providers.
    pub url: Option<String>,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
    /// 0 disables pacing.
    pub requests_per_minute: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hash".to_string(),
            model: None,
            dims: 384,
            url: None,
            max_retries: 2,
            retry_delay_ms: 500,
            timeout_secs: 30,
            requests_per_minute: 80,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SummaryConfig {
    /// `extractive` or `openai`.
    pub provider: String,
    pub model: Option<String>,
    pub url: Option<String>,
    pub max_sentences: usize,
    pub timeout_secs: u64,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            provider: "extractive".to_string(),
            model: None,
            url: None,
            max_sentences: 4,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 200,
            chunk_overlap: 20,
            min_chunk_size: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub default_collection: String,
    pub hybrid_semantic_weight: f64,
    pub hybrid_keyword_weight: f64,
    pub min_similarity_score: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            max_top_k: 50,
            default_collection: "default".to_string(),
            hybrid_semantic_weight: 0.7,
            hybrid_keyword_weight: 0.3,
            min_similarity_score: 0.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestionConfig {
    pub max_document_tokens: usize,
    pub max_batch_size: usize,
    pub auto_summary: bool,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_document_tokens: 50_000,
            max_batch_size: 50,
            auto_summary: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct KnowledgeBaseConfig {
    pub enabled: bool,
    pub root: PathBuf,
    /// Defaults to `<data_dir>/kb_manifest.json`.
    pub manifest_file: Option<PathBuf>,
    pub collection: String,
    pub poll_interval_secs: f64,
    pub max_file_size: u64,
    /// Lowercase extensions without the dot.
    pub extensions: Vec<String>,
    pub exclude_globs: Vec<String>,
}

pub const DEFAULT_KB_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rst", "json", "yaml", "yml", "csv", "tsv", "py", "js", "ts",
    "java", "c", "cpp", "h", "go", "rs", "html", "htm", "xml", "log", "cfg", "ini", "toml",
    "pdf", "docx",
];

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            root: PathBuf::from("./knowledge_base"),
            manifest_file: None,
            collection: "default".to_string(),
            poll_interval_secs: 5.0,
            max_file_size: 10 * 1024 * 1024,
            extensions: DEFAULT_KB_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            exclude_globs: Vec::new(),
        }
    }
}

impl KnowledgeBaseConfig {
    pub fn manifest_path(&self, storage: &StorageConfig) -> PathBuf {
        self.manifest_file
            .clone()
            .unwrap_or_else(|| storage.data_dir.join("kb_manifest.json"))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Check cross-field constraints. Called by [`load_config`]; call it
    /// directly when building a `Config` in code.
    pub fn validate(&self) -> Result<()> {
        if self.storage.store_dir() == self.storage.index_dir() {
            bail!(
                "storage.store_dir and storage.index_dir must differ (both are {})",
                self.storage.store_dir().display()
            );
        }
        if self.chunking.chunk_size == 0 {
            bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            bail!("chunking.chunk_overlap must be < chunking.chunk_size");
        }

        let r = &self.retrieval;
        if r.max_top_k < 1 {
            bail!("retrieval.max_top_k must be >= 1");
        }
        if r.default_top_k < 1 || r.default_top_k > r.max_top_k {
            bail!("retrieval.default_top_k must be in [1, retrieval.max_top_k]");
        }
        if !(0.0..=1.0).contains(&r.min_similarity_score) {
            bail!("retrieval.min_similarity_score must be in [0.0, 1.0]");
        }
        if r.hybrid_semantic_weight < 0.0 || r.hybrid_keyword_weight < 0.0 {
            bail!("retrieval hybrid weights must be >= 0");
        }

        if self.embedding.dims == 0 {
            bail!("embedding.dims must be > 0");
        }
        match self.embedding.provider.as_str() {
            "hash" | "openai" | "ollama" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hash, openai, or ollama.",
                other
            ),
        }
        match self.summary.provider.as_str() {
            "extractive" | "openai" => {}
            other => bail!(
                "Unknown summary provider: '{}'. Must be extractive or openai.",
                other
            ),
        }

        if self.ingestion.max_batch_size == 0 {
            bail!("ingestion.max_batch_size must be > 0");
        }
        let poll = self.knowledge_base.poll_interval_secs;
        if poll.is_nan() || poll <= 0.0 {
            bail!("knowledge_base.poll_interval_secs must be > 0");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
