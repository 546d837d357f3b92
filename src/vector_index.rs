//! Persisted brute-force vector index, one file per collection.
//!
//! Vectors are kept as rows of a dense matrix in insertion order. Search
//! L2-normalises the query and every row, takes dot products, and returns
//! the top `k` by descending cosine similarity; ties keep insertion order.
//!
//! The file (`index_dir/{collection}.json`) stores `{dimension, ids,
//! vectors}`. It is rewritten atomically after every mutation and removed
//! when the last vector is deleted. The dimension is fixed by the first
//! write; a vector of any other length is rejected.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use staged_rag_core::vector::{dot, l2_normalize};

use crate::error::{RagError, RagResult};
use crate::store::{lock, write_json_atomic};

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexData {
    dimension: usize,
    ids: Vec<String>,
    vectors: Vec<Vec<f32>>,
}

pub struct VectorIndex {
    path: PathBuf,
    data: Mutex<IndexData>,
}

impl VectorIndex {
    /// Open the index at `path`, loading it if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> RagResult<Self> {
        let path = path.into();
        let data = if path.exists() {
            let data: IndexData = serde_json::from_slice(&fs::read(&path)?)?;
            if data.ids.len() != data.vectors.len() {
                return Err(RagError::validation(format!(
                    "corrupt vector index {}: {} ids but {} vectors",
                    path.display(),
                    data.ids.len(),
                    data.vectors.len()
                )));
            }
            data
        } else {
            IndexData::default()
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, data: &IndexData) -> RagResult<()> {
        if data.ids.is_empty() {
            if self.path.exists() {
                fs::remove_file(&self.path)?;
            }
            return Ok(());
        }
        write_json_atomic(&self.path, data)
    }

    /// Check that a vector of length `dims` could be stored here.
    pub fn check_dimension(&self, dims: usize) -> RagResult<()> {
        if dims == 0 {
            return Err(RagError::validation("vector must not be empty"));
        }
        match self.dimension() {
            Some(expected) if expected != dims => Err(RagError::validation(format!(
                "vector dimension {} does not match index dimension {}",
                dims, expected
            ))),
            _ => Ok(()),
        }
    }

    /// Insert or overwrite the vector for `id`, then persist. On a failed
    /// write the in-memory rows are restored.
    pub fn upsert(&self, id: &str, vector: Vec<f32>) -> RagResult<()> {
        if vector.is_empty() {
            return Err(RagError::validation("vector must not be empty"));
        }
        let mut data = lock(&self.data);
        let previous_dimension = data.dimension;
        if data.ids.is_empty() {
            data.dimension = vector.len();
        } else if vector.len() != data.dimension {
            return Err(RagError::validation(format!(
                "vector dimension {} does not match index dimension {}",
                vector.len(),
                data.dimension
            )));
        }
        let existing_row = data.ids.iter().position(|existing| existing == id);
        let replaced = match existing_row {
            Some(row) => Some((row, std::mem::replace(&mut data.vectors[row], vector))),
            None => {
                data.ids.push(id.to_string());
                data.vectors.push(vector);
                None
            }
        };
        if let Err(e) = self.persist(&data) {
            match replaced {
                Some((row, old)) => data.vectors[row] = old,
                None => {
                    data.ids.pop();
                    data.vectors.pop();
                }
            }
            data.dimension = previous_dimension;
            return Err(e);
        }
        Ok(())
    }

    /// Remove `id`. Returns whether it was present.
    pub fn delete(&self, id: &str) -> RagResult<bool> {
        let mut data = lock(&self.data);
        let Some(row) = data.ids.iter().position(|existing| existing == id) else {
            return Ok(false);
        };
        let removed_id = data.ids.remove(row);
        let removed_vector = data.vectors.remove(row);
        if let Err(e) = self.persist(&data) {
            data.ids.insert(row, removed_id);
            data.vectors.insert(row, removed_vector);
            return Err(e);
        }
        Ok(true)
    }

    /// Top `k` ids by cosine similarity to `query`.
    pub fn search(&self, query: &[f32], k: usize) -> RagResult<Vec<(String, f32)>> {
        let data = lock(&self.data);
        if data.ids.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != data.dimension {
            return Err(RagError::validation(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                data.dimension
            )));
        }

        let mut q = query.to_vec();
        l2_normalize(&mut q);

        let mut scored: Vec<(usize, f32)> = data
            .vectors
            .iter()
            .enumerate()
            .map(|(row, v)| {
                let mut v = v.clone();
                l2_normalize(&mut v);
                (row, dot(&v, &q))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(row, score)| (data.ids[row].clone(), score))
            .collect())
    }

    pub fn get(&self, id: &str) -> Option<Vec<f32>> {
        let data = lock(&self.data);
        let row = data.ids.iter().position(|existing| existing == id)?;
        Some(data.vectors[row].clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.data).ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed dimension, or `None` before the first write.
    pub fn dimension(&self) -> Option<usize> {
        let data = lock(&self.data);
        (!data.ids.is_empty()).then_some(data.dimension)
    }

    /// Size of the backing file in bytes (0 if it does not exist).
    pub fn file_size(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

/// Per-collection [`VectorIndex`] instances, opened on first access.
pub struct IndexRegistry {
    dir: PathBuf,
    indexes: Mutex<HashMap<String, Arc<VectorIndex>>>,
}

impl IndexRegistry {
    pub fn open(dir: impl Into<PathBuf>) -> RagResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            indexes: Mutex::new(HashMap::new()),
        })
    }

    pub fn get(&self, collection: &str) -> RagResult<Arc<VectorIndex>> {
        let mut indexes = lock(&self.indexes);
        if let Some(index) = indexes.get(collection) {
            return Ok(Arc::clone(index));
        }
        let index = Arc::new(VectorIndex::open(
            self.dir.join(format!("{}.json", collection)),
        )?);
        indexes.insert(collection.to_string(), Arc::clone(&index));
        Ok(index)
    }
}
