//! Tiered embedding generation: three interchangeable providers behind one
//! capability, a write-through cache, per-tier concurrency caps, and a live
//! provider-health map.

pub mod cache;
mod cloudflare;
mod local;
mod openai;

pub use cloudflare::CloudflareProvider;
pub use local::{LocalProvider, LOCAL_DIM};
pub use openai::OpenAiProvider;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::{Config, EmbedStrategy};
use crate::error::MnemoError;
use crate::SharedStore;

/// Self-check budget for cloud providers at startup.
const HEALTH_CHECK_BUDGET: Duration = Duration::from_secs(10);

/// Cloud calls fan out wide; local model invocations must never thrash a
/// small host.
const CLOUD_CONCURRENCY: usize = 20;
const LOCAL_CONCURRENCY: usize = 2;

const CACHE_CAPACITY: usize = 512;

/// A source of embedding vectors. Implementations are "configured" when
/// their required credentials are present; the local fallback always is.
#[async_trait]
pub trait EmbedProvider: Send + Sync {
    /// Stable short name, persisted in `embed_provider` and cache entries.
    fn name(&self) -> &'static str;

    fn configured(&self) -> bool;

    /// Local providers acquire the small semaphore and are excluded from the
    /// force-cloud path.
    fn local(&self) -> bool {
        false
    }

    /// Embed a batch; MUST return exactly one vector per input, in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MnemoError>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, MnemoError> {
        let texts = [text.to_string()];
        let mut vecs = self.embed_batch(&texts).await?;
        vecs.pop()
            .ok_or_else(|| MnemoError::Provider(self.name().into(), "empty response".into()))
    }
}

/// Cache key: fixed-width digest of the exact text whose vector is stored.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Serialize an f32 vector to bytes (little-endian) for SQLite BLOB storage.
pub fn vector_to_bytes(v: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(v.len() * 4);
    for &f in v {
        buf.extend_from_slice(&f.to_le_bytes());
    }
    buf
}

/// Deserialize bytes back to an f32 vector.
pub fn bytes_to_vector(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().expect("4 bytes");
            f32::from_le_bytes(arr)
        })
        .collect()
}

/// Chooses a provider chain by strategy, enforces per-tier concurrency caps,
/// diffs batches against the cache, and tracks provider health.
pub struct EmbedManager {
    chain: Vec<Arc<dyn EmbedProvider>>,
    cache: cache::EmbedCache,
    down: RwLock<HashSet<String>>,
    cloud_sem: Semaphore,
    local_sem: Semaphore,
}

impl EmbedManager {
    /// Build the manager from configuration and kick off the async health
    /// self-check. Must be called from within a tokio runtime.
    pub fn new(cfg: &Config, store: &SharedStore) -> Arc<Self> {
        let cloudflare: Arc<dyn EmbedProvider> = Arc::new(CloudflareProvider::new(cfg));
        let openai: Arc<dyn EmbedProvider> = Arc::new(OpenAiProvider::new(cfg));
        let local: Arc<dyn EmbedProvider> = Arc::new(LocalProvider::new());

        let chain = match cfg.strategy {
            EmbedStrategy::CloudFirst => vec![cloudflare, openai, local],
            EmbedStrategy::AccuracyFirst => vec![openai, cloudflare, local],
            EmbedStrategy::LocalOnly => vec![local],
        };

        let mgr = Self::with_chain(chain, store.clone());
        mgr.spawn_health_check();
        mgr
    }

    /// Build from an explicit, already-ordered chain. Skips the startup
    /// probe; callers may invoke `spawn_health_check` themselves.
    pub fn with_chain(chain: Vec<Arc<dyn EmbedProvider>>, store: SharedStore) -> Arc<Self> {
        Arc::new(Self {
            chain,
            cache: cache::EmbedCache::with_store(CACHE_CAPACITY, store),
            down: RwLock::new(HashSet::new()),
            cloud_sem: Semaphore::new(CLOUD_CONCURRENCY),
            local_sem: Semaphore::new(LOCAL_CONCURRENCY),
        })
    }

    /// Probe each configured cloud provider with a harmless input. Any
    /// failure flips that provider to DOWN; the local provider is never
    /// probed. DOWN sticks until a forced cloud call succeeds (the Healer's
    /// cadence doubles as the recovery probe).
    pub fn spawn_health_check(self: &Arc<Self>) {
        for provider in self.chain.iter().filter(|p| !p.local() && p.configured()) {
            let provider = Arc::clone(provider);
            let mgr = Arc::clone(self);
            tokio::spawn(async move {
                let Ok(_permit) = mgr.cloud_sem.acquire().await else { return };
                match tokio::time::timeout(HEALTH_CHECK_BUDGET, provider.embed_one("ping")).await {
                    Ok(Ok(_)) => {
                        info!(provider = provider.name(), "embedding health check passed");
                    }
                    Ok(Err(e)) => {
                        warn!(provider = provider.name(), error = %e,
                            "embedding health check failed, marking DOWN");
                        mgr.mark_down(provider.name());
                    }
                    Err(_) => {
                        warn!(provider = provider.name(),
                            "embedding health check timed out, marking DOWN");
                        mgr.mark_down(provider.name());
                    }
                }
            });
        }
    }

    pub fn is_down(&self, name: &str) -> bool {
        self.down.read().contains(name)
    }

    pub(crate) fn mark_down(&self, name: &str) {
        self.down.write().insert(name.to_string());
    }

    pub(crate) fn clear_down(&self, name: &str) {
        self.down.write().remove(name);
    }

    /// Convenience wrapper over `embed_batch` for a single text.
    pub async fn embed_one(&self, text: &str) -> Result<(Vec<f32>, String), MnemoError> {
        let (mut vectors, mut providers) = self.embed_batch(&[text.to_string()]).await?;
        match (vectors.pop(), providers.pop()) {
            (Some(v), Some(p)) => Ok((v, p)),
            _ => Err(MnemoError::Internal("empty embedding result".into())),
        }
    }

    /// Embed a batch with partial-cache-hit diffing: only texts that miss the
    /// cache are sent to the provider chain, and only those are written back.
    /// Returns one vector per input, in order, plus the provider recorded for
    /// each position.
    pub async fn embed_batch(
        &self,
        texts: &[String],
    ) -> Result<(Vec<Vec<f32>>, Vec<String>), MnemoError> {
        if texts.is_empty() {
            return Ok((vec![], vec![]));
        }
        let hashes: Vec<String> = texts.iter().map(|t| content_hash(t)).collect();

        let cache = self.cache.clone();
        let lookup = hashes.clone();
        let cached: Vec<Option<(Vec<f32>, String)>> =
            tokio::task::spawn_blocking(move || lookup.iter().map(|h| cache.get(h)).collect())
                .await
                .map_err(|e| MnemoError::Internal(e.to_string()))?;

        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut providers: Vec<String> = vec![String::new(); texts.len()];
        let mut missing: Vec<usize> = Vec::new();
        for (i, entry) in cached.into_iter().enumerate() {
            match entry {
                Some((vec, provider)) => {
                    vectors[i] = Some(vec);
                    providers[i] = provider;
                }
                None => missing.push(i),
            }
        }

        if !missing.is_empty() {
            let missing_texts: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let (new_vecs, provider) = self.try_chain(&missing_texts, false).await?;

            let entries: Vec<(String, Vec<f32>)> = missing
                .iter()
                .zip(new_vecs.iter())
                .map(|(&i, v)| (hashes[i].clone(), v.clone()))
                .collect();
            let cache = self.cache.clone();
            let stamp = provider.clone();
            tokio::task::spawn_blocking(move || {
                for (hash, vec) in &entries {
                    cache.put(hash, vec, &stamp);
                }
            })
            .await
            .map_err(|e| MnemoError::Internal(e.to_string()))?;

            for (&i, vec) in missing.iter().zip(new_vecs.into_iter()) {
                vectors[i] = Some(vec);
                providers[i] = provider.clone();
            }
        }

        let mut out = Vec::with_capacity(texts.len());
        for v in vectors {
            out.push(v.ok_or_else(|| MnemoError::Internal("embedding result missing".into()))?);
        }
        Ok((out, providers))
    }

    /// Repair path: bypass cache reads, try cloud providers only — including
    /// ones marked DOWN — and unconditionally overwrite cache entries on
    /// success. A success clears the provider's DOWN flag.
    pub async fn force_cloud_batch(
        &self,
        texts: &[String],
    ) -> Result<(Vec<Vec<f32>>, String), MnemoError> {
        if texts.is_empty() {
            return Err(MnemoError::Validation("force_cloud_batch needs at least one text".into()));
        }
        let (vectors, provider) = self.try_chain(texts, true).await?;

        let entries: Vec<(String, Vec<f32>)> = texts
            .iter()
            .zip(vectors.iter())
            .map(|(t, v)| (content_hash(t), v.clone()))
            .collect();
        let cache = self.cache.clone();
        let stamp = provider.clone();
        tokio::task::spawn_blocking(move || {
            for (hash, vec) in &entries {
                cache.put(hash, vec, &stamp);
            }
        })
        .await
        .map_err(|e| MnemoError::Internal(e.to_string()))?;

        Ok((vectors, provider))
    }

    /// Walk the effective chain until one provider delivers. Provider
    /// failures advance the chain; only exhaustion surfaces as an error.
    async fn try_chain(
        &self,
        texts: &[String],
        cloud_only: bool,
    ) -> Result<(Vec<Vec<f32>>, String), MnemoError> {
        let mut last_err: Option<MnemoError> = None;

        for provider in &self.chain {
            if cloud_only && provider.local() {
                continue;
            }
            if !provider.configured() {
                continue;
            }
            // The forced path ignores the DOWN flag: it is the recovery probe.
            if !cloud_only && self.is_down(provider.name()) {
                continue;
            }

            let _permit = if provider.local() {
                self.local_sem.acquire().await
            } else {
                self.cloud_sem.acquire().await
            }
            .map_err(|e| MnemoError::Internal(e.to_string()))?;

            match provider.embed_batch(texts).await {
                Ok(vecs) if vecs.len() == texts.len() => {
                    debug!(provider = provider.name(), count = texts.len(), "embedded batch");
                    if cloud_only {
                        self.clear_down(provider.name());
                    }
                    return Ok((vecs, provider.name().to_string()));
                }
                Ok(vecs) => {
                    warn!(provider = provider.name(), sent = texts.len(), got = vecs.len(),
                        "embedding count mismatch");
                    last_err = Some(MnemoError::Provider(
                        provider.name().into(),
                        format!("returned {} embeddings, expected {}", vecs.len(), texts.len()),
                    ));
                }
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "embedding provider failed");
                    last_err = Some(e);
                }
            }
        }

        Err(MnemoError::AllProvidersFailed(
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "no provider configured".into()),
        ))
    }
}

#[async_trait]
impl crate::vecstore::EmbeddingSource for EmbedManager {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, MnemoError> {
        self.embed_one(text).await.map(|(vec, _)| vec)
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod manager_tests;
