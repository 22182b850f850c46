//! Embedding cache: small LRU in memory, write-through to the metadata
//! store's `embedding_cache` table, warmed from it at startup.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::{info, warn};

use crate::SharedStore;

#[derive(Clone)]
pub struct EmbedCache {
    inner: Arc<parking_lot::Mutex<LruCache<String, (Vec<f32>, String)>>>,
    store: SharedStore,
}

impl EmbedCache {
    /// Create and warm the LRU from the persistent cache.
    pub fn with_store(capacity: usize, store: SharedStore) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(128).expect("nonzero"));
        let mut cache = LruCache::new(cap);
        match store.cache_load_recent(capacity) {
            Ok(entries) => {
                let loaded = entries.len();
                // loaded newest-first; insert oldest-first so the newest end
                // up most-recently-used
                for (hash, vector, provider) in entries.into_iter().rev() {
                    cache.put(hash, (vector, provider));
                }
                if loaded > 0 {
                    info!(loaded, "embedding cache warmed from db");
                }
            }
            Err(e) => warn!(error = %e, "embedding cache warm-up failed"),
        }
        Self { inner: Arc::new(parking_lot::Mutex::new(cache)), store }
    }

    /// Look up a hash: LRU first, then the persistent table (promoting hits
    /// into the LRU). Blocking — call from a blocking context.
    pub fn get(&self, hash: &str) -> Option<(Vec<f32>, String)> {
        if let Some(hit) = self.inner.lock().get(hash).cloned() {
            return Some(hit);
        }
        match self.store.cache_get(hash) {
            Ok(Some((vector, provider))) => {
                self.inner.lock().put(hash.to_string(), (vector.clone(), provider.clone()));
                Some((vector, provider))
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "embedding cache read failed");
                None
            }
        }
    }

    /// Write-through insert; replaces vector and provider together.
    pub fn put(&self, hash: &str, vector: &[f32], provider: &str) {
        if let Err(e) = self.store.cache_put(hash, vector, provider) {
            warn!(error = %e, "embedding cache write failed");
        }
        self.inner.lock().put(hash.to_string(), (vector.to_vec(), provider.to_string()));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
