//! Knowledge-base folder mirroring.
//!
//! A [`KnowledgeBase`] keeps a directory tree in sync with one collection.
//! It owns a [`FileWatcher`] and a [`Manifest`] and drives the retrieval
//! engine's ingest and delete operations to close any gap between them:
//!
//! - **created**: extract text, derive a title and tags, ingest, record.
//! - **modified**: delete the old document, then ingest again. A path
//!   that is reported again with unchanged content is left alone.
//! - **deleted**: delete the document and drop the manifest entry.
//!
//! Every per-file operation runs while holding the manifest lock, so the
//! watcher thread and direct calls (`initial_sync`, `force_resync`) never
//! interleave their changes to the same folder. Failures are recorded per
//! file and never abort a sync.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use staged_rag_core::text::clean_text;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::extract::{DefaultExtractor, TextExtractor};
use crate::manifest::{EntryStatus, Manifest, ManifestEntry, ManifestStats};
use crate::service::{validate_collection, IngestRequest, Metadata, RetrievalEngine};
use crate::store::lock;
use crate::watcher::{diff_snapshots, hash_file, FileWatcher, Snapshot, WatchHandler};

const MAX_TITLE_CHARS: usize = 120;

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub created: usize,
    pub modified: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct KbStatus {
    pub kb_dir: String,
    pub collection: String,
    pub watcher_running: bool,
    pub manifest: ManifestStats,
}

/// First line that looks like a heading: at least five characters and not
/// just a page number.
pub fn title_from_text(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| line.chars().count() >= 5 && !line.chars().all(|c| c.is_ascii_digit()))
        .map(|line| {
            if line.chars().count() > MAX_TITLE_CHARS {
                let head: String = line.chars().take(MAX_TITLE_CHARS - 3).collect();
                format!("{}...", head)
            } else {
                line.to_string()
            }
        })
}

/// `release_notes-v2.md` → `Release Notes V2`.
pub fn title_from_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    stem.replace(['_', '-'], " ")
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// `filetype:<ext>`, `source:knowledge_base`, and one `folder:<name>` per
/// parent directory of `rel_path`.
pub fn derive_tags(rel_path: &str) -> Vec<String> {
    let path = Path::new(rel_path);
    let mut tags = Vec::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        tags.push(format!("filetype:{}", ext.to_ascii_lowercase()));
    }
    tags.push("source:knowledge_base".to_string());
    if let Some(parent) = path.parent() {
        for part in parent.components() {
            let part = part.as_os_str().to_string_lossy();
            if !part.is_empty() && part != "." {
                tags.push(format!("folder:{}", part));
            }
        }
    }
    tags
}

struct KbInner {
    engine: Arc<RetrievalEngine>,
    manifest: Mutex<Manifest>,
    extractor: Box<dyn TextExtractor>,
    root: PathBuf,
    collection: String,
    max_file_size: u64,
}

impl KbInner {
    fn failed_entry(rel: &str, hash: &str, size: u64, status: EntryStatus, reason: String) -> ManifestEntry {
        let mut entry = ManifestEntry::new(rel, hash, size, status);
        entry.error = Some(reason);
        entry
    }

    /// Ingest one file and record the outcome. `None` means the file was
    /// gone before it could be read.
    ///
    /// A file whose entry already has the same content hash is left alone.
    /// Otherwise any live document for the path is deleted first, so a path
    /// never owns more than one document.
    fn ingest_file(&self, manifest: &mut Manifest, rel: &str) -> Result<Option<EntryStatus>> {
        let path = self.root.join(rel);
        let Ok(meta) = fs::metadata(&path) else {
            warn!(path = %rel, "file no longer exists");
            return Ok(None);
        };
        let size = meta.len();
        let hash = hash_file(&path).with_context(|| format!("Failed to hash {}", rel))?;

        if let Some(entry) = manifest.get(rel) {
            if entry.status != EntryStatus::Deleted && entry.content_hash == hash {
                debug!(path = %rel, "file unchanged, not ingesting");
                return Ok(Some(entry.status));
            }
        }
        self.delete_live_doc(manifest, rel)?;

        if size > self.max_file_size {
            warn!(path = %rel, size, max = self.max_file_size, "file too large, not ingesting");
            let reason = format!("file too large ({} bytes, max {})", size, self.max_file_size);
            manifest.upsert(Self::failed_entry(rel, &hash, size, EntryStatus::Error, reason))?;
            return Ok(Some(EntryStatus::Error));
        }

        let extracted = self.extractor.extract(&path);
        if extracted.text.trim().is_empty() {
            let (status, reason) = match extracted.error {
                Some(reason) => (EntryStatus::Error, reason),
                None => (EntryStatus::Skipped, "empty or unsupported file".to_string()),
            };
            info!(path = %rel, reason = %reason, "not ingesting file");
            manifest.upsert(Self::failed_entry(rel, &hash, size, status, reason))?;
            return Ok(Some(status));
        }

        let text = clean_text(&extracted.text);
        let title = title_from_text(&text).unwrap_or_else(|| title_from_path(&path));
        let extension = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
            .unwrap_or_default();
        let mut metadata = Metadata::new();
        metadata.insert("kb_relative_path".into(), rel.into());
        metadata.insert("file_extension".into(), extension.into());
        metadata.insert("file_size".into(), size.into());
        metadata.insert("ingested_from".into(), "knowledge_base".into());

        let request = IngestRequest {
            title,
            text,
            source: format!("knowledge_base:{}", rel),
            tags: derive_tags(rel),
            metadata,
            summary: None,
        };
        let entry = match self.engine.ingest(request, &self.collection) {
            Ok(resp) => {
                info!(path = %rel, doc_id = %resp.doc_id, "indexed knowledge-base file");
                let mut entry = ManifestEntry::new(rel, &hash, size, EntryStatus::Indexed);
                entry.doc_id = resp.doc_id;
                entry
            }
            Err(e) => {
                error!(path = %rel, error = %e, "failed to index knowledge-base file");
                Self::failed_entry(rel, &hash, size, EntryStatus::Error, e.to_string())
            }
        };
        let status = entry.status;
        manifest.upsert(entry)?;
        Ok(Some(status))
    }

    fn delete_live_doc(&self, manifest: &Manifest, rel: &str) -> Result<()> {
        if let Some(doc_id) = manifest.get(rel).and_then(|e| e.live_doc_id()) {
            self.engine.delete_document(doc_id, &self.collection)?;
            info!(path = %rel, doc_id, "removed document for file");
        }
        Ok(())
    }

    fn remove_file(&self, manifest: &mut Manifest, rel: &str) -> Result<()> {
        self.delete_live_doc(manifest, rel)?;
        manifest.remove(rel)?;
        Ok(())
    }
}

impl WatchHandler for KbInner {
    fn on_created(&self, rel_path: &str) -> Result<()> {
        self.ingest_file(&mut lock(&self.manifest), rel_path).map(|_| ())
    }

    fn on_modified(&self, rel_path: &str) -> Result<()> {
        self.ingest_file(&mut lock(&self.manifest), rel_path).map(|_| ())
    }

    fn on_deleted(&self, rel_path: &str) -> Result<()> {
        self.remove_file(&mut lock(&self.manifest), rel_path)
    }
}

pub struct KnowledgeBase {
    inner: Arc<KbInner>,
    watcher: FileWatcher,
}

impl KnowledgeBase {
    /// Mirror the configured knowledge-base folder into `engine`.
    pub fn open(engine: Arc<RetrievalEngine>, config: &Config) -> Result<Self> {
        Self::with_extractor(engine, config, Box::new(DefaultExtractor))
    }

    pub fn with_extractor(
        engine: Arc<RetrievalEngine>,
        config: &Config,
        extractor: Box<dyn TextExtractor>,
    ) -> Result<Self> {
        let kb = &config.knowledge_base;
        validate_collection(&kb.collection)?;
        fs::create_dir_all(&kb.root)
            .with_context(|| format!("Failed to create knowledge base dir: {}", kb.root.display()))?;
        let root = kb.root.canonicalize().unwrap_or_else(|_| kb.root.clone());

        let manifest = Manifest::load(kb.manifest_path(&config.storage), &root);
        let mut watcher_config = kb.clone();
        watcher_config.root = root.clone();
        let watcher = FileWatcher::from_config(&watcher_config)?;

        Ok(Self {
            inner: Arc::new(KbInner {
                engine,
                manifest: Mutex::new(manifest),
                extractor,
                root,
                collection: kb.collection.clone(),
                max_file_size: kb.max_file_size,
            }),
            watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn collection(&self) -> &str {
        &self.inner.collection
    }

    /// Reconcile the folder against the manifest, then reset the watcher's
    /// baseline to the manifest so later polls see only new changes.
    pub fn initial_sync(&self) -> Result<SyncStats> {
        let started = Instant::now();
        let inner = &self.inner;
        fs::create_dir_all(&inner.root)?;

        let current = self.watcher.scan();
        let known = lock(&inner.manifest).known_hashes();
        let changes = diff_snapshots(&known, &current);
        info!(
            root = %inner.root.display(),
            created = changes.created.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            "knowledge base sync started"
        );

        let mut stats = SyncStats::default();
        for rel in &changes.created {
            let outcome = inner.ingest_file(&mut lock(&inner.manifest), rel);
            tally(&mut stats, rel, outcome, |s| s.created += 1);
        }
        for rel in &changes.modified {
            let outcome = inner.ingest_file(&mut lock(&inner.manifest), rel);
            tally(&mut stats, rel, outcome, |s| s.modified += 1);
        }
        for rel in &changes.deleted {
            match inner.remove_file(&mut lock(&inner.manifest), rel) {
                Ok(()) => stats.deleted += 1,
                Err(e) => {
                    error!(path = %rel, error = %e, "failed to remove file from index");
                    stats.errors += 1;
                }
            }
        }

        let known = {
            let mut manifest = lock(&inner.manifest);
            manifest.mark_scanned()?;
            manifest.known_hashes()
        };
        self.watcher.set_known(known);
        info!(
            created = stats.created,
            modified = stats.modified,
            deleted = stats.deleted,
            skipped = stats.skipped,
            errors = stats.errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "knowledge base sync complete"
        );
        Ok(stats)
    }

    /// Delete every indexed document, clear the manifest, and sync again
    /// from an empty baseline. A running watcher is paused for the duration.
    pub fn force_resync(&self) -> Result<SyncStats> {
        info!(root = %self.inner.root.display(), "force resync requested");
        let was_running = self.is_running();
        if was_running {
            self.watcher.stop();
        }
        let result = self.clear_and_sync();
        if was_running {
            self.spawn_watcher()?;
        }
        result
    }

    fn clear_and_sync(&self) -> Result<SyncStats> {
        {
            let mut manifest = lock(&self.inner.manifest);
            let doc_ids: Vec<String> = manifest
                .entries()
                .filter(|e| e.status == EntryStatus::Indexed)
                .filter_map(|e| e.live_doc_id().map(str::to_string))
                .collect();
            for doc_id in doc_ids {
                if let Err(e) = self.inner.engine.delete_document(&doc_id, &self.inner.collection) {
                    warn!(doc_id = %doc_id, error = %e, "failed to delete document during resync");
                }
            }
            manifest.clear()?;
        }
        self.watcher.set_known(Snapshot::new());
        self.initial_sync()
    }

    /// Run [`initial_sync`](Self::initial_sync), then start watching.
    pub fn start(&self) -> Result<SyncStats> {
        let stats = self.initial_sync()?;
        self.spawn_watcher()?;
        Ok(stats)
    }

    fn spawn_watcher(&self) -> Result<()> {
        let handler: Arc<dyn WatchHandler> = self.inner.clone();
        self.watcher.start(handler)
    }

    pub fn stop(&self) {
        self.watcher.stop();
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_running()
    }

    pub fn status(&self) -> KbStatus {
        KbStatus {
            kb_dir: self.inner.root.display().to_string(),
            collection: self.inner.collection.clone(),
            watcher_running: self.is_running(),
            manifest: lock(&self.inner.manifest).stats(),
        }
    }

    /// A copy of the manifest entry for `rel_path`.
    pub fn entry(&self, rel_path: &str) -> Option<ManifestEntry> {
        lock(&self.inner.manifest).get(rel_path).cloned()
    }

    pub fn entries(&self) -> Vec<ManifestEntry> {
        lock(&self.inner.manifest).entries().cloned().collect()
    }
}

fn tally(
    stats: &mut SyncStats,
    rel: &str,
    outcome: Result<Option<EntryStatus>>,
    on_success: impl FnOnce(&mut SyncStats),
) {
    match outcome {
        Ok(Some(EntryStatus::Indexed)) => on_success(stats),
        Ok(Some(EntryStatus::Skipped)) => stats.skipped += 1,
        Ok(Some(EntryStatus::Error)) => stats.errors += 1,
        Ok(Some(EntryStatus::Deleted)) | Ok(None) => {}
        Err(e) => {
            error!(path = %rel, error = %e, "failed to sync file");
            stats.errors += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Extracted;
    use crate::service::tests::engine;
    use tempfile::TempDir;

    fn kb(tmp: &TempDir, max_file_size: u64) -> (Arc<RetrievalEngine>, KnowledgeBase) {
        let engine = Arc::new(engine(tmp));
        let mut config = engine.config().clone();
        config.knowledge_base.root = tmp.path().join("kb");
        config.knowledge_base.max_file_size = max_file_size;
        config.knowledge_base.poll_interval_secs = 0.05;
        let kb = KnowledgeBase::open(Arc::clone(&engine), &config).unwrap();
        (engine, kb)
    }

    const NOTE: &str = "Deployment Checklist\n\nRun the database migrations before restarting the service. \
        Verify the health endpoint returns success after the rollout completes.";

    #[test]
    fn test_title_from_text() {
        assert_eq!(title_from_text("\n12\nabc\n  Real Heading  \nbody").as_deref(), Some("Real Heading"));
        assert_eq!(title_from_text("123456\n"), None);
        let long = "x".repeat(200);
        let title = title_from_text(&long).unwrap();
        assert_eq!(title.chars().count(), 120);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_title_from_path() {
        assert_eq!(title_from_path(Path::new("a/release_notes-v2.md")), "Release Notes V2");
        assert_eq!(title_from_path(Path::new("README.txt")), "Readme");
    }

    #[test]
    fn test_derive_tags() {
        assert_eq!(
            derive_tags("guides/ops/deploy.MD"),
            vec![
                "filetype:md",
                "source:knowledge_base",
                "folder:guides",
                "folder:ops"
            ]
        );
        assert_eq!(derive_tags("top.txt"), vec!["filetype:txt", "source:knowledge_base"]);
    }

    #[test]
    fn test_sync_records_metadata_and_tags() {
        let tmp = TempDir::new().unwrap();
        let (engine, kb) = kb(&tmp, 1024 * 1024);
        fs::create_dir_all(kb.root().join("ops")).unwrap();
        fs::write(kb.root().join("ops/deploy.md"), NOTE).unwrap();

        let stats = kb.initial_sync().unwrap();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.errors, 0);

        let entry = kb.entry("ops/deploy.md").unwrap();
        assert_eq!(entry.status, EntryStatus::Indexed);
        let doc = engine.store.get("default", &entry.doc_id).unwrap().unwrap();
        assert_eq!(doc.title, "Deployment Checklist");
        assert_eq!(doc.source, "knowledge_base:ops/deploy.md");
        assert!(doc.tags.contains(&"folder:ops".to_string()));
        assert_eq!(doc.metadata["file_extension"], ".md");
        assert_eq!(doc.metadata["ingested_from"], "knowledge_base");
    }

    #[test]
    fn test_oversized_and_empty_files_are_recorded() {
        let tmp = TempDir::new().unwrap();
        let (engine, kb) = kb(&tmp, 64);
        fs::write(kb.root().join("big.txt"), "word ".repeat(100)).unwrap();
        fs::write(kb.root().join("empty.txt"), "   \n").unwrap();

        let stats = kb.initial_sync().unwrap();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(kb.entry("big.txt").unwrap().status, EntryStatus::Error);
        assert!(kb.entry("big.txt").unwrap().error.unwrap().contains("too large"));
        assert_eq!(kb.entry("empty.txt").unwrap().status, EntryStatus::Skipped);
        assert_eq!(engine.store.count("default").unwrap(), 0);

        // Broken files are not offered again.
        let again = kb.initial_sync().unwrap();
        assert_eq!(again, SyncStats::default());
    }

    struct FailingExtractor;

    impl TextExtractor for FailingExtractor {
        fn extract(&self, _path: &Path) -> Extracted {
            Extracted {
                text: String::new(),
                error: Some("cannot parse".into()),
            }
        }
    }

    #[test]
    fn test_extraction_failure_is_error_entry() {
        let tmp = TempDir::new().unwrap();
        let engine = Arc::new(engine(&tmp));
        let mut config = engine.config().clone();
        config.knowledge_base.root = tmp.path().join("kb");
        let kb = KnowledgeBase::with_extractor(engine, &config, Box::new(FailingExtractor)).unwrap();
        fs::write(kb.root().join("a.txt"), NOTE).unwrap();

        kb.initial_sync().unwrap();
        let entry = kb.entry("a.txt").unwrap();
        assert_eq!(entry.status, EntryStatus::Error);
        assert_eq!(entry.error.as_deref(), Some("cannot parse"));
    }

    #[test]
    fn test_force_resync_replaces_documents() {
        let tmp = TempDir::new().unwrap();
        let (engine, kb) = kb(&tmp, 1024 * 1024);
        fs::write(kb.root().join("a.txt"), NOTE).unwrap();
        kb.initial_sync().unwrap();
        let before = kb.entry("a.txt").unwrap().doc_id;

        let stats = kb.force_resync().unwrap();
        assert_eq!(stats.created, 1);
        let after = kb.entry("a.txt").unwrap().doc_id;
        assert_ne!(before, after);
        assert_eq!(engine.store.count("default").unwrap(), 1);
        assert!(engine.store.get("default", &before).unwrap().is_none());
    }

    #[test]
    fn test_repeated_create_keeps_one_document() {
        let tmp = TempDir::new().unwrap();
        let (engine, kb) = kb(&tmp, 1024 * 1024);
        fs::write(kb.root().join("a.txt"), NOTE).unwrap();
        kb.initial_sync().unwrap();
        let first = kb.entry("a.txt").unwrap().doc_id;

        kb.inner.on_created("a.txt").unwrap();
        assert_eq!(kb.entry("a.txt").unwrap().doc_id, first);
        assert_eq!(engine.store.count("default").unwrap(), 1);

        fs::write(kb.root().join("a.txt"), "A different note about winter gardening and frost cloth.").unwrap();
        kb.inner.on_created("a.txt").unwrap();
        let second = kb.entry("a.txt").unwrap().doc_id;
        assert_ne!(first, second);
        assert_eq!(engine.store.count("default").unwrap(), 1);
        assert!(engine.store.get("default", &first).unwrap().is_none());
    }

    #[test]
    fn test_force_resync_while_watching() {
        let tmp = TempDir::new().unwrap();
        let (engine, kb) = kb(&tmp, 1024 * 1024);
        for i in 0..10 {
            fs::write(kb.root().join(format!("note{}.txt", i)), NOTE).unwrap();
        }
        kb.start().unwrap();
        for _ in 0..3 {
            kb.force_resync().unwrap();
            assert!(kb.is_running());
        }
        kb.stop();

        assert_eq!(engine.store.count("default").unwrap(), 10);
        assert_eq!(kb.status().manifest.total_indexed, 10);
    }

    #[test]
    fn test_watcher_picks_up_new_file() {
        let tmp = TempDir::new().unwrap();
        let (engine, kb) = kb(&tmp, 1024 * 1024);
        kb.start().unwrap();
        assert!(kb.status().watcher_running);

        fs::write(kb.root().join("late.txt"), NOTE).unwrap();
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        let indexed = |kb: &KnowledgeBase| {
            kb.entry("late.txt")
                .is_some_and(|e| e.status == EntryStatus::Indexed)
        };
        while !indexed(&kb) && Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        kb.stop();

        assert!(!kb.status().watcher_running);
        assert_eq!(kb.entry("late.txt").unwrap().status, EntryStatus::Indexed);
        assert_eq!(engine.store.count("default").unwrap(), 1);
        assert_eq!(kb.status().manifest.total_indexed, 1);
    }
}
