//! Persisted record of which knowledge-base files became which documents.
//!
//! One entry per relative path ever seen, including files that failed or
//! were skipped, so broken files are not retried on every poll. The file is
//! rewritten atomically after every mutation:
//!
//! ```json
//! {
//!   "version": 1,
//!   "kb_dir": "/abs/path/to/knowledge_base",
//!   "files": { "notes/a.md": { "doc_id": "…", "content_hash": "…", "status": "indexed", … } },
//!   "stats": { "total_files": 1, "total_indexed": 1, "total_errors": 0, "last_scan": "…" }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RagResult;
use crate::store::write_json_atomic;
use crate::watcher::Snapshot;

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Indexed,
    Skipped,
    Error,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub relative_path: String,
    /// Empty unless the file was ingested.
    #[serde(default)]
    pub doc_id: String,
    pub content_hash: String,
    pub file_size: u64,
    pub indexed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ManifestEntry {
    pub fn new(relative_path: &str, content_hash: &str, file_size: u64, status: EntryStatus) -> Self {
        let now = Utc::now();
        Self {
            relative_path: relative_path.to_string(),
            doc_id: String::new(),
            content_hash: content_hash.to_string(),
            file_size,
            indexed_at: now,
            updated_at: now,
            status,
            error: None,
        }
    }

    /// The document this entry points at, if any.
    pub fn live_doc_id(&self) -> Option<&str> {
        (!self.doc_id.is_empty() && self.status != EntryStatus::Deleted)
            .then_some(self.doc_id.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestStats {
    pub total_files: usize,
    pub total_indexed: usize,
    pub total_errors: usize,
    pub last_scan: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestFile {
    version: u32,
    kb_dir: String,
    #[serde(default)]
    files: BTreeMap<String, ManifestEntry>,
    #[serde(default)]
    stats: ManifestStats,
}

pub struct Manifest {
    path: PathBuf,
    kb_dir: String,
    files: BTreeMap<String, ManifestEntry>,
    last_scan: Option<DateTime<Utc>>,
}

impl Manifest {
    /// Load the manifest at `path`. A missing or unreadable file starts an
    /// empty manifest.
    pub fn load(path: impl Into<PathBuf>, kb_dir: &Path) -> Self {
        let path = path.into();
        let mut manifest = Self {
            path,
            kb_dir: kb_dir.display().to_string(),
            files: BTreeMap::new(),
            last_scan: None,
        };
        if !manifest.path.exists() {
            return manifest;
        }
        let parsed = fs::read(&manifest.path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                serde_json::from_slice::<ManifestFile>(&bytes).map_err(|e| e.to_string())
            });
        match parsed {
            Ok(file) => {
                manifest.files = file.files;
                manifest.last_scan = file.stats.last_scan;
            }
            Err(e) => warn!(
                path = %manifest.path.display(),
                error = %e,
                "manifest unreadable, starting empty"
            ),
        }
        manifest
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, rel_path: &str) -> Option<&ManifestEntry> {
        self.files.get(rel_path)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.files.values()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Insert or replace the entry for its path and persist.
    pub fn upsert(&mut self, entry: ManifestEntry) -> RagResult<()> {
        self.files.insert(entry.relative_path.clone(), entry);
        self.save()
    }

    /// Drop the entry for `rel_path` and persist. Returns the removed entry.
    pub fn remove(&mut self, rel_path: &str) -> RagResult<Option<ManifestEntry>> {
        let removed = self.files.remove(rel_path);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn clear(&mut self) -> RagResult<()> {
        self.files.clear();
        self.save()
    }

    /// Record that a scan finished and persist.
    pub fn mark_scanned(&mut self) -> RagResult<()> {
        self.last_scan = Some(Utc::now());
        self.save()
    }

    /// Hashes of every path the watcher should treat as already seen:
    /// everything except entries marked deleted.
    pub fn known_hashes(&self) -> Snapshot {
        self.files
            .iter()
            .filter(|(_, e)| e.status != EntryStatus::Deleted)
            .map(|(path, e)| (path.clone(), e.content_hash.clone()))
            .collect()
    }

    pub fn stats(&self) -> ManifestStats {
        ManifestStats {
            total_files: self.files.len(),
            total_indexed: self.count(EntryStatus::Indexed),
            total_errors: self.count(EntryStatus::Error),
            last_scan: self.last_scan,
        }
    }

    fn count(&self, status: EntryStatus) -> usize {
        self.files.values().filter(|e| e.status == status).count()
    }

    fn save(&self) -> RagResult<()> {
        let file = ManifestFile {
            version: MANIFEST_VERSION,
            kb_dir: self.kb_dir.clone(),
            files: self.files.clone(),
            stats: self.stats(),
        };
        write_json_atomic(&self.path, &file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn indexed(path: &str, hash: &str, doc_id: &str) -> ManifestEntry {
        let mut e = ManifestEntry::new(path, hash, 10, EntryStatus::Indexed);
        e.doc_id = doc_id.to_string();
        e
    }

    #[test]
    fn test_persists_across_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.json");
        {
            let mut m = Manifest::load(&path, tmp.path());
            m.upsert(indexed("a.txt", "h1", "d1")).unwrap();
            let mut broken = ManifestEntry::new("b.pdf", "h2", 5, EntryStatus::Error);
            broken.error = Some("bad pdf".into());
            m.upsert(broken).unwrap();
            m.mark_scanned().unwrap();
        }
        let m = Manifest::load(&path, tmp.path());
        assert_eq!(m.len(), 2);
        assert_eq!(m.get("a.txt").unwrap().doc_id, "d1");
        assert_eq!(m.get("b.pdf").unwrap().error.as_deref(), Some("bad pdf"));
        let stats = m.stats();
        assert_eq!(stats.total_indexed, 1);
        assert_eq!(stats.total_errors, 1);
        assert!(stats.last_scan.is_some());

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["files"]["a.txt"]["status"], "indexed");
        assert_eq!(raw["stats"]["total_files"], 2);
    }

    #[test]
    fn test_known_hashes_skip_only_deleted() {
        let tmp = TempDir::new().unwrap();
        let mut m = Manifest::load(tmp.path().join("m.json"), tmp.path());
        m.upsert(indexed("a.txt", "h1", "d1")).unwrap();
        m.upsert(ManifestEntry::new("b.txt", "h2", 0, EntryStatus::Skipped)).unwrap();
        m.upsert(ManifestEntry::new("c.txt", "h3", 0, EntryStatus::Error)).unwrap();
        m.upsert(ManifestEntry::new("d.txt", "h4", 0, EntryStatus::Deleted)).unwrap();
        let known = m.known_hashes();
        assert_eq!(known.len(), 3);
        assert!(!known.contains_key("d.txt"));
        assert_eq!(known["c.txt"], "h3");
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("m.json");
        std::fs::write(&path, "{not json").unwrap();
        let mut m = Manifest::load(&path, tmp.path());
        assert!(m.is_empty());
        m.upsert(indexed("a.txt", "h", "d")).unwrap();
        assert_eq!(Manifest::load(&path, tmp.path()).len(), 1);
    }

    #[test]
    fn test_remove_and_live_doc_id() {
        let tmp = TempDir::new().unwrap();
        let mut m = Manifest::load(tmp.path().join("m.json"), tmp.path());
        m.upsert(indexed("a.txt", "h1", "d1")).unwrap();
        assert_eq!(m.get("a.txt").unwrap().live_doc_id(), Some("d1"));
        assert!(ManifestEntry::new("x", "h", 0, EntryStatus::Error)
            .live_doc_id()
            .is_none());
        assert!(m.remove("a.txt").unwrap().is_some());
        assert!(m.remove("a.txt").unwrap().is_none());
        assert!(m.is_empty());
    }
}
