//! Persistent embedding index keyed by memory id.
//!
//! Documents live in an in-memory map for brute-force cosine queries and are
//! persisted one JSON file per document under the store's directory, so an
//! existing directory reattaches without data loss. The store depends only on
//! an embedding capability and is handed whatever object implements it.
//! All filesystem work and the index scan run on the blocking thread pool,
//! the same discipline `store_call` enforces for the metadata store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::MnemoError;

/// The one thing the index needs from the outside world: text in, vector out.
#[async_trait]
pub trait EmbeddingSource: Send + Sync {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, MnemoError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VecDocument {
    pub id: String,
    pub content: String,
    pub metadata: HashMap<String, String>,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VecMatch {
    pub id: String,
    pub similarity: f32,
}

pub struct VectorStore {
    dir: PathBuf,
    embedder: Arc<dyn EmbeddingSource>,
    docs: Arc<RwLock<HashMap<String, VecDocument>>>,
}

impl VectorStore {
    /// Open the index at `dir`, creating the directory if needed and loading
    /// any documents a previous process left behind.
    pub async fn open(
        dir: impl AsRef<Path>,
        embedder: Arc<dyn EmbeddingSource>,
    ) -> Result<Self, MnemoError> {
        let dir = dir.as_ref().to_path_buf();
        let scan_dir = dir.clone();
        let docs = tokio::task::spawn_blocking(move || load_documents(&scan_dir))
            .await
            .map_err(|e| MnemoError::Internal(e.to_string()))??;
        debug!(count = docs.len(), dir = %dir.display(), "vector index loaded");

        Ok(Self { dir, embedder, docs: Arc::new(RwLock::new(docs)) })
    }

    fn doc_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Insert or replace a document. A pre-computed vector skips the
    /// embedding call — the memory service always passes one, since it
    /// already paid for it.
    pub async fn upsert(
        &self,
        id: &str,
        content: &str,
        metadata: HashMap<String, String>,
        vector: Option<Vec<f32>>,
    ) -> Result<(), MnemoError> {
        let vector = match vector {
            Some(v) => v,
            None => self.embedder.embed_text(content).await?,
        };
        let doc = VecDocument {
            id: id.to_string(),
            content: content.to_string(),
            metadata,
            vector,
        };

        let bytes = serde_json::to_vec(&doc)
            .map_err(|e| MnemoError::VectorStore(format!("serialize {id}: {e}")))?;
        let path = self.doc_path(id);
        let persist_id = id.to_string();
        tokio::task::spawn_blocking(move || {
            std::fs::write(&path, bytes)
                .map_err(|e| MnemoError::VectorStore(format!("persist {persist_id}: {e}")))
        })
        .await
        .map_err(|e| MnemoError::Internal(e.to_string()))??;

        self.docs.write().insert(doc.id.clone(), doc);
        Ok(())
    }

    /// Nearest neighbors for `text`, highest similarity first. The metadata
    /// filter is exact equality over every given key, AND-combined; an empty
    /// filter matches everything. An empty index yields an empty list.
    pub async fn query(
        &self,
        text: &str,
        top_k: usize,
        filter: &HashMap<String, String>,
    ) -> Result<Vec<VecMatch>, MnemoError> {
        if self.docs.read().is_empty() {
            return Ok(vec![]);
        }
        let top_k = if top_k == 0 { 5 } else { top_k };
        let query_vec = self.embedder.embed_text(text).await?;

        let docs = Arc::clone(&self.docs);
        let filter = filter.clone();
        let scored = tokio::task::spawn_blocking(move || {
            let docs = docs.read();
            let mut scored: Vec<VecMatch> = docs
                .values()
                .filter(|doc| {
                    filter
                        .iter()
                        .all(|(k, v)| doc.metadata.get(k).is_some_and(|dv| dv == v))
                })
                .map(|doc| VecMatch {
                    id: doc.id.clone(),
                    similarity: cosine_similarity(&query_vec, &doc.vector),
                })
                .collect();
            scored.sort_by(|a, b| {
                b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal)
            });
            scored.truncate(top_k);
            scored
        })
        .await
        .map_err(|e| MnemoError::Internal(e.to_string()))?;

        Ok(scored)
    }

    /// Best-effort removal; missing ids are not errors.
    pub async fn delete(&self, ids: &[String]) {
        let removals: Vec<(String, PathBuf)> = {
            let mut docs = self.docs.write();
            ids.iter()
                .map(|id| {
                    docs.remove(id);
                    (id.clone(), self.doc_path(id))
                })
                .collect()
        };
        let result = tokio::task::spawn_blocking(move || {
            for (id, path) in removals {
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(id = %id, error = %e, "failed to remove vector document");
                    }
                }
            }
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, "vector document removal task failed");
        }
    }

    pub fn count(&self) -> usize {
        self.docs.read().len()
    }
}

/// Blocking directory scan used by `open`.
fn load_documents(dir: &Path) -> Result<HashMap<String, VecDocument>, MnemoError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| MnemoError::VectorStore(format!("create {}: {e}", dir.display())))?;

    let mut docs = HashMap::new();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| MnemoError::VectorStore(format!("read {}: {e}", dir.display())))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        match std::fs::read(&path).map_err(|e| e.to_string()).and_then(|bytes| {
            serde_json::from_slice::<VecDocument>(&bytes).map_err(|e| e.to_string())
        }) {
            Ok(doc) => {
                docs.insert(doc.id.clone(), doc);
            }
            Err(e) => {
                // A corrupt file costs one vector, not the whole index;
                // the Healer re-embeds anything the metadata store still
                // references.
                warn!(path = %path.display(), error = %e, "skipping unreadable vector document");
            }
        }
    }
    Ok(docs)
}

/// Cosine similarity between two vectors. Mismatched lengths score 0 — such
/// pairs come from provider switches and become queryable once healed.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for i in 0..a.len() {
        let (ai, bi) = (a[i] as f64, b[i] as f64);
        dot += ai * bi;
        na += ai * ai;
        nb += bi * bi;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        (dot / denom) as f32
    }
}

#[cfg(test)]
#[path = "vecstore_tests.rs"]
mod vecstore_tests;
