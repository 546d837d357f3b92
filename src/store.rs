//! JSON-backed document store, one file per collection.
//!
//! `store_dir/{collection}.json` holds a map of `doc_id → Document`. Each
//! collection is loaded on first access and cached; every mutation rewrites
//! the whole file atomically (temp file + rename) while holding that
//! collection's lock, so a load-mutate-persist sequence is never interleaved
//! with another mutation of the same collection.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use staged_rag_core::models::Document;

use crate::error::RagResult;

type Docs = BTreeMap<String, Document>;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> RagResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let body = serde_json::to_vec_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub struct DocumentStore {
    dir: PathBuf,
    collections: Mutex<HashMap<String, Arc<Mutex<Docs>>>>,
}

impl DocumentStore {
    pub fn open(dir: impl Into<PathBuf>) -> RagResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            collections: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}.json", collection))
    }

    /// The cached document map for `collection`, loading it on miss.
    fn collection(&self, collection: &str) -> RagResult<Arc<Mutex<Docs>>> {
        let mut registry = lock(&self.collections);
        if let Some(docs) = registry.get(collection) {
            return Ok(Arc::clone(docs));
        }
        let path = self.path_for(collection);
        let docs: Docs = if path.exists() {
            serde_json::from_slice(&fs::read(&path)?)?
        } else {
            Docs::new()
        };
        let docs = Arc::new(Mutex::new(docs));
        registry.insert(collection.to_string(), Arc::clone(&docs));
        Ok(docs)
    }

    fn persist(&self, collection: &str, docs: &Docs) -> RagResult<()> {
        write_json_atomic(&self.path_for(collection), docs)
    }

    pub fn save(&self, collection: &str, document: Document) -> RagResult<()> {
        self.save_many(collection, vec![document])
    }

    /// Insert or replace documents. On a failed write the cached
    /// collection is restored to its previous contents.
    pub fn save_many(&self, collection: &str, documents: Vec<Document>) -> RagResult<()> {
        let handle = self.collection(collection)?;
        let mut docs = lock(&handle);
        let mut previous = Vec::with_capacity(documents.len());
        for doc in documents {
            let id = doc.doc_id.clone();
            let old = docs.insert(id.clone(), doc);
            previous.push((id, old));
        }
        if let Err(e) = self.persist(collection, &docs) {
            for (id, old) in previous.into_iter().rev() {
                match old {
                    Some(doc) => docs.insert(id, doc),
                    None => docs.remove(&id),
                };
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn get(&self, collection: &str, doc_id: &str) -> RagResult<Option<Document>> {
        let handle = self.collection(collection)?;
        let docs = lock(&handle);
        Ok(docs.get(doc_id).cloned())
    }

    pub fn list(&self, collection: &str) -> RagResult<Vec<Document>> {
        let handle = self.collection(collection)?;
        let docs = lock(&handle);
        Ok(docs.values().cloned().collect())
    }

    pub fn count(&self, collection: &str) -> RagResult<usize> {
        let handle = self.collection(collection)?;
        let docs = lock(&handle);
        Ok(docs.len())
    }

    /// Apply `f` to a copy of a stored document and persist it, as one
    /// locked step. The cache only keeps the change if the write succeeds.
    ///
    /// Returns the updated document, or `None` if `doc_id` is unknown (in
    /// which case nothing is written).
    pub fn update<F>(&self, collection: &str, doc_id: &str, f: F) -> RagResult<Option<Document>>
    where
        F: FnOnce(&mut Document),
    {
        let handle = self.collection(collection)?;
        let mut docs = lock(&handle);
        let Some(original) = docs.get(doc_id).cloned() else {
            return Ok(None);
        };
        let mut updated = original.clone();
        f(&mut updated);
        docs.insert(doc_id.to_string(), updated.clone());
        if let Err(e) = self.persist(collection, &docs) {
            docs.insert(doc_id.to_string(), original);
            return Err(e);
        }
        Ok(Some(updated))
    }

    /// Remove a document. Returns it if it existed.
    pub fn delete(&self, collection: &str, doc_id: &str) -> RagResult<Option<Document>> {
        let handle = self.collection(collection)?;
        let mut docs = lock(&handle);
        let Some(removed) = docs.remove(doc_id) else {
            return Ok(None);
        };
        if let Err(e) = self.persist(collection, &docs) {
            docs.insert(doc_id.to_string(), removed);
            return Err(e);
        }
        Ok(Some(removed))
    }

    /// Names of every collection with a store file on disk, sorted.
    pub fn collections(&self) -> RagResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
