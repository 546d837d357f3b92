//! # Staged RAG CLI (`srag`)
//!
//! Every command prints JSON on stdout. Logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! srag --config ./config/srag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `srag ingest <file>` | Ingest one file as a document |
//! | `srag batch <file.json>` | Ingest a JSON array of documents |
//! | `srag update <id>` | Replace fields of a document |
//! | `srag search "<query>"` | Rank document summaries |
//! | `srag hybrid "<query>"` | Semantic + keyword search |
//! | `srag multi "<q1>" "<q2>"` | Fuse several queries |
//! | `srag similar <id>` | Documents resembling another |
//! | `srag explain "<query>" <id>...` | Signal breakdown per document |
//! | `srag get <id>...` | Full documents |
//! | `srag meta <id>` | Metadata without text |
//! | `srag chunk <id> --index N` / `--query Q` | One chunk |
//! | `srag delete <id>` | Remove a document |
//! | `srag stats` / `srag collections` | Collection overview |
//! | `srag kb sync\|resync\|status\|watch` | Knowledge-base folder sync |
//!
//! Engine errors are printed as `{"error": ..., "kind": ...}` and the
//! process exits non-zero.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use staged_rag::config::{self, Config};
use staged_rag::extract::{DefaultExtractor, TextExtractor};
use staged_rag::kb::{title_from_path, title_from_text, KnowledgeBase};
use staged_rag::service::{IngestRequest, UpdateRequest};
use staged_rag::{logging, FusionMethod, RagError, RetrievalEngine};

/// Staged RAG CLI: summary-first document retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/srag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "srag",
    about = "Staged RAG: summary-first document retrieval",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/srag.toml")]
    config: PathBuf,

    /// Collection to operate on. Defaults to `retrieval.default_collection`.
    #[arg(long, global = true)]
    collection: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest one file as a document.
    ///
    /// Text is extracted by file type (plain text, PDF, DOCX). The title
    /// defaults to the first substantial line, then the file name.
    Ingest {
        file: PathBuf,
        #[arg(long)]
        title: Option<String>,
        #[arg(long, default_value = "manual")]
        source: String,
        /// Comma-separated tags.
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        /// Use this summary instead of generating one.
        #[arg(long)]
        summary: Option<String>,
    },

    /// Ingest a JSON array of `{title, text, source?, tags?, metadata?, summary?}`.
    Batch { file: PathBuf },

    /// Replace fields of an existing document.
    Update {
        doc_id: String,
        #[arg(long)]
        title: Option<String>,
        /// Read replacement text from this file.
        #[arg(long)]
        text_file: Option<PathBuf>,
        #[arg(long)]
        summary: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Option<Vec<String>>,
    },

    /// Rank document summaries by similarity to a query.
    Search {
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        min_score: Option<f64>,
        /// Only documents carrying at least one of these tags.
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },

    /// Weighted semantic + BM25 search.
    Hybrid {
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        semantic_weight: Option<f64>,
        #[arg(long)]
        keyword_weight: Option<f64>,
    },

    /// Run several queries and fuse the rankings.
    Multi {
        #[arg(required = true)]
        queries: Vec<String>,
        #[arg(long)]
        top_k: Option<usize>,
        /// `rrf` (default) or `max`.
        #[arg(long, default_value = "rrf")]
        fusion: String,
    },

    /// Documents similar to an existing one.
    Similar {
        doc_id: String,
        #[arg(long)]
        top_k: Option<usize>,
        /// Skip documents with the same source label.
        #[arg(long)]
        exclude_same_source: bool,
    },

    /// Break down how each signal scores the given documents.
    Explain {
        query: String,
        #[arg(required = true)]
        doc_ids: Vec<String>,
    },

    /// Fetch full documents.
    Get {
        #[arg(required = true)]
        doc_ids: Vec<String>,
        /// Include chunk boundaries.
        #[arg(long)]
        chunks: bool,
    },

    /// Document metadata without its text.
    Meta { doc_id: String },

    /// Fetch a single chunk by position or by relevance to a query.
    Chunk {
        doc_id: String,
        #[arg(long)]
        index: Option<usize>,
        #[arg(long)]
        query: Option<String>,
    },

    /// Remove a document.
    Delete { doc_id: String },

    /// Statistics for one collection.
    Stats,

    /// List collections with document and token counts.
    Collections,

    /// Knowledge-base folder operations.
    Kb {
        #[command(subcommand)]
        action: KbAction,
    },
}

#[derive(Subcommand)]
enum KbAction {
    /// Reconcile the folder with the manifest once.
    Sync,
    /// Drop every knowledge-base document and ingest the folder again.
    Resync,
    /// Show the manifest summary.
    Status,
    /// Sync, then keep watching for changes.
    Watch {
        /// Stop after this many seconds (runs until killed by default).
        #[arg(long)]
        duration: Option<u64>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_document(path: &Path) -> Result<String> {
    let extracted = DefaultExtractor.extract(path);
    if let Some(reason) = extracted.error {
        anyhow::bail!("Failed to read {}: {}", path.display(), reason);
    }
    Ok(extracted.text)
}

fn run(cli: Cli) -> Result<()> {
    let cfg: Config = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    let collection = cli
        .collection
        .clone()
        .unwrap_or_else(|| cfg.retrieval.default_collection.clone());
    let engine = Arc::new(RetrievalEngine::open(cfg.clone())?);
    let top = |k: Option<usize>| k.unwrap_or(cfg.retrieval.default_top_k);

    match cli.command {
        Commands::Ingest {
            file,
            title,
            source,
            tags,
            summary,
        } => {
            let text = read_document(&file)?;
            let title = title
                .or_else(|| title_from_text(&text))
                .unwrap_or_else(|| title_from_path(&file));
            let request = IngestRequest {
                title,
                text,
                source,
                tags,
                summary,
                ..Default::default()
            };
            print_json(&engine.ingest(request, &collection)?)?;
        }
        Commands::Batch { file } => {
            let body = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read batch file: {}", file.display()))?;
            let requests: Vec<IngestRequest> =
                serde_json::from_str(&body).with_context(|| "Failed to parse batch file")?;
            print_json(&engine.batch_ingest(requests, &collection)?)?;
        }
        Commands::Update {
            doc_id,
            title,
            text_file,
            summary,
            tags,
        } => {
            let text = text_file.as_deref().map(read_document).transpose()?;
            let request = UpdateRequest {
                text,
                title,
                tags,
                metadata: None,
                summary,
            };
            print_json(&engine.update_document(&doc_id, &collection, request)?)?;
        }
        Commands::Search {
            query,
            top_k,
            min_score,
            tags,
        } => {
            let min_score = min_score.unwrap_or(cfg.retrieval.min_similarity_score);
            let tags = (!tags.is_empty()).then_some(tags.as_slice());
            print_json(&engine.search_summaries(&query, top(top_k), &collection, min_score, tags)?)?;
        }
        Commands::Hybrid {
            query,
            top_k,
            semantic_weight,
            keyword_weight,
        } => {
            let sw = semantic_weight.unwrap_or(cfg.retrieval.hybrid_semantic_weight);
            let kw = keyword_weight.unwrap_or(cfg.retrieval.hybrid_keyword_weight);
            print_json(&engine.hybrid_search(&query, top(top_k), &collection, sw, kw)?)?;
        }
        Commands::Multi {
            queries,
            top_k,
            fusion,
        } => {
            let method = FusionMethod::parse(&fusion);
            print_json(&engine.multi_query_search(&queries, top(top_k), &collection, method)?)?;
        }
        Commands::Similar {
            doc_id,
            top_k,
            exclude_same_source,
        } => {
            print_json(&engine.find_similar(&doc_id, top(top_k), exclude_same_source, &collection)?)?;
        }
        Commands::Explain { query, doc_ids } => {
            print_json(&engine.explain_retrieval(&query, &doc_ids, &collection)?)?;
        }
        Commands::Get { doc_ids, chunks } => {
            print_json(&engine.get_documents(&doc_ids, &collection, chunks)?)?;
        }
        Commands::Meta { doc_id } => {
            print_json(&engine.get_document_metadata(&doc_id, &collection)?)?;
        }
        Commands::Chunk {
            doc_id,
            index,
            query,
        } => {
            print_json(&engine.get_document_chunk(&doc_id, &collection, index, query.as_deref())?)?;
        }
        Commands::Delete { doc_id } => {
            print_json(&engine.delete_document(&doc_id, &collection)?)?;
        }
        Commands::Stats => {
            print_json(&engine.collection_stats(&collection)?)?;
        }
        Commands::Collections => {
            print_json(&engine.list_collections()?)?;
        }
        Commands::Kb { action } => {
            if !cfg.knowledge_base.enabled {
                return Err(RagError::validation(
                    "knowledge base is disabled; set knowledge_base.enabled = true",
                )
                .into());
            }
            let kb = KnowledgeBase::open(Arc::clone(&engine), &cfg)?;
            match action {
                KbAction::Sync => print_json(&kb.initial_sync()?)?,
                KbAction::Resync => print_json(&kb.force_resync()?)?,
                KbAction::Status => print_json(&kb.status())?,
                KbAction::Watch { duration } => {
                    print_json(&kb.start()?)?;
                    match duration {
                        Some(secs) => std::thread::sleep(Duration::from_secs(secs)),
                        None => loop {
                            std::thread::sleep(Duration::from_secs(3600));
                        },
                    }
                    kb.stop();
                    print_json(&kb.status())?;
                }
            }
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let body = match e.downcast_ref::<RagError>() {
                Some(rag) => rag.to_response(),
                None => serde_json::json!({ "error": format!("{:#}", e), "kind": "internal" }),
            };
            println!("{}", body);
            ExitCode::FAILURE
        }
    }
}
