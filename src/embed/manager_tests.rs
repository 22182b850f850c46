use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::*;
use crate::db::MetaStore;

fn test_store() -> SharedStore {
    Arc::new(MetaStore::open(":memory:").expect("in-memory store"))
}

/// Cloud-tier stub that records how many calls and texts reached it.
struct CountingProvider {
    calls: AtomicUsize,
    texts_seen: AtomicUsize,
}

impl CountingProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), texts_seen: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl EmbedProvider for CountingProvider {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn configured(&self) -> bool {
        true
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MnemoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts_seen.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0, 2.0]).collect())
    }
}

/// Cloud-tier stub whose availability can be toggled.
struct FlakyProvider {
    up: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyProvider {
    fn new(up: bool) -> Arc<Self> {
        Arc::new(Self { up: AtomicBool::new(up), calls: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl EmbedProvider for FlakyProvider {
    fn name(&self) -> &'static str {
        "flaky-cloud"
    }

    fn configured(&self) -> bool {
        true
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MnemoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.up.load(Ordering::SeqCst) {
            return Err(MnemoError::Provider(self.name().into(), "connection refused".into()));
        }
        Ok(texts.iter().map(|_| vec![9.0, 9.0, 9.0]).collect())
    }
}

/// A provider with missing credentials; must never be called.
struct UnconfiguredProvider;

#[async_trait]
impl EmbedProvider for UnconfiguredProvider {
    fn name(&self) -> &'static str {
        "unconfigured"
    }

    fn configured(&self) -> bool {
        false
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, MnemoError> {
        panic!("unconfigured provider must be skipped");
    }
}

/// Violates the one-vector-per-text contract.
struct ShortchangingProvider;

#[async_trait]
impl EmbedProvider for ShortchangingProvider {
    fn name(&self) -> &'static str {
        "shortchanging"
    }

    fn configured(&self) -> bool {
        true
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, MnemoError> {
        Ok(vec![vec![1.0]])
    }
}

#[tokio::test]
async fn cache_hit_skips_provider() {
    let counting = CountingProvider::new();
    let mgr = EmbedManager::with_chain(vec![counting.clone()], test_store());

    let (v1, p1) = mgr.embed_one("hello world").await.unwrap();
    let (v2, p2) = mgr.embed_one("hello world").await.unwrap();

    assert_eq!(counting.calls.load(Ordering::SeqCst), 1, "second call must be a cache hit");
    assert_eq!(v1, v2);
    assert_eq!(p1, "counting");
    assert_eq!(p2, "counting", "cache hits report the provider recorded in the entry");
}

#[tokio::test]
async fn partial_hit_sends_only_missing_texts() {
    let counting = CountingProvider::new();
    let mgr = EmbedManager::with_chain(vec![counting.clone()], test_store());

    let first = vec!["alpha".to_string(), "beta".to_string()];
    mgr.embed_batch(&first).await.unwrap();
    assert_eq!(counting.texts_seen.load(Ordering::SeqCst), 2);

    let second = vec![
        "alpha".to_string(),
        "gamma".to_string(),
        "beta".to_string(),
        "delta".to_string(),
    ];
    let (vectors, providers) = mgr.embed_batch(&second).await.unwrap();

    // only gamma and delta were recomputed
    assert_eq!(counting.texts_seen.load(Ordering::SeqCst), 4);
    assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    assert_eq!(vectors.len(), 4);
    assert_eq!(providers, vec!["counting"; 4]);
    // order matches inputs: "alpha" (len 5) vs "beta" (len 4)
    assert_eq!(vectors[0][0], 5.0);
    assert_eq!(vectors[2][0], 4.0);
}

#[tokio::test]
async fn full_cache_hit_makes_zero_calls() {
    let counting = CountingProvider::new();
    let mgr = EmbedManager::with_chain(vec![counting.clone()], test_store());

    let texts = vec!["one".to_string(), "two".to_string()];
    mgr.embed_batch(&texts).await.unwrap();
    let calls_before = counting.calls.load(Ordering::SeqCst);
    mgr.embed_batch(&texts).await.unwrap();
    assert_eq!(counting.calls.load(Ordering::SeqCst), calls_before);
}

#[tokio::test]
async fn chain_advances_past_failing_provider() {
    let flaky = FlakyProvider::new(false);
    let mgr = EmbedManager::with_chain(
        vec![flaky.clone(), Arc::new(LocalProvider::new())],
        test_store(),
    );

    let (vector, provider) = mgr.embed_one("degrade gracefully").await.unwrap();
    assert_eq!(provider, "local");
    assert_eq!(vector.len(), LOCAL_DIM);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 1, "cloud tier tried first");
}

#[tokio::test]
async fn unconfigured_and_down_providers_are_skipped() {
    let counting = CountingProvider::new();
    let mgr = EmbedManager::with_chain(
        vec![Arc::new(UnconfiguredProvider), counting.clone(), Arc::new(LocalProvider::new())],
        test_store(),
    );

    let (_, provider) = mgr.embed_one("first").await.unwrap();
    assert_eq!(provider, "counting");

    mgr.mark_down("counting");
    assert!(mgr.is_down("counting"));
    let (_, provider) = mgr.embed_one("second").await.unwrap();
    assert_eq!(provider, "local");
    assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhausted_chain_surfaces_all_providers_failed() {
    let mgr = EmbedManager::with_chain(vec![FlakyProvider::new(false)], test_store());
    let err = mgr.embed_one("nowhere to go").await.unwrap_err();
    assert!(matches!(err, MnemoError::AllProvidersFailed(_)), "got {err:?}");

    let mgr = EmbedManager::with_chain(vec![Arc::new(UnconfiguredProvider)], test_store());
    let err = mgr.embed_one("nothing configured").await.unwrap_err();
    assert!(matches!(err, MnemoError::AllProvidersFailed(_)), "got {err:?}");
}

#[tokio::test]
async fn count_mismatch_advances_chain() {
    let mgr = EmbedManager::with_chain(
        vec![Arc::new(ShortchangingProvider), Arc::new(LocalProvider::new())],
        test_store(),
    );
    let texts = vec!["a".to_string(), "b".to_string()];
    let (vectors, providers) = mgr.embed_batch(&texts).await.unwrap();
    assert_eq!(vectors.len(), 2);
    assert_eq!(providers, vec!["local"; 2]);
}

#[tokio::test]
async fn force_cloud_overwrites_cache_and_recovers_health() {
    let flaky = FlakyProvider::new(false);
    let mgr = EmbedManager::with_chain(
        vec![flaky.clone(), Arc::new(LocalProvider::new())],
        test_store(),
    );

    // Outage: writes degrade to local and the entry is stamped accordingly.
    let (_, provider) = mgr.embed_one("server IP is 1.2.3.4").await.unwrap();
    assert_eq!(provider, "local");
    mgr.mark_down("flaky-cloud");

    // Still down: the forced path reports chain exhaustion.
    let texts = vec!["server IP is 1.2.3.4".to_string()];
    let err = mgr.force_cloud_batch(&texts).await.unwrap_err();
    assert!(matches!(err, MnemoError::AllProvidersFailed(_)));
    assert!(mgr.is_down("flaky-cloud"));

    // Provider comes back: forced call succeeds despite the DOWN flag,
    // clears it, and rewrites the cache entry.
    flaky.up.store(true, Ordering::SeqCst);
    let (vectors, provider) = mgr.force_cloud_batch(&texts).await.unwrap();
    assert_eq!(provider, "flaky-cloud");
    assert_eq!(vectors[0], vec![9.0, 9.0, 9.0]);
    assert!(!mgr.is_down("flaky-cloud"));

    let flaky_calls = flaky.calls.load(Ordering::SeqCst);
    let (vector, provider) = mgr.embed_one("server IP is 1.2.3.4").await.unwrap();
    assert_eq!(provider, "flaky-cloud", "cache entry now carries the cloud provider");
    assert_eq!(vector, vec![9.0, 9.0, 9.0]);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), flaky_calls, "served from cache");
}

#[tokio::test]
async fn force_cloud_excludes_local() {
    let mgr = EmbedManager::with_chain(vec![Arc::new(LocalProvider::new())], test_store());
    let err = mgr.force_cloud_batch(&["anything".to_string()]).await.unwrap_err();
    assert!(matches!(err, MnemoError::AllProvidersFailed(_)));
}

#[tokio::test]
async fn cache_persists_across_manager_instances() {
    let store = test_store();
    let counting = CountingProvider::new();
    let mgr = EmbedManager::with_chain(vec![counting.clone()], store.clone());
    mgr.embed_one("durable entry").await.unwrap();

    // A fresh manager over the same store warms from the persistent cache.
    let counting2 = CountingProvider::new();
    let mgr2 = EmbedManager::with_chain(vec![counting2.clone()], store);
    let (_, provider) = mgr2.embed_one("durable entry").await.unwrap();
    assert_eq!(provider, "counting");
    assert_eq!(counting2.calls.load(Ordering::SeqCst), 0);
}

/// Local-tier stub that records how many calls run concurrently.
struct GaugedLocal {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl GaugedLocal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            current: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl EmbedProvider for GaugedLocal {
    fn name(&self) -> &'static str {
        "gauged-local"
    }

    fn configured(&self) -> bool {
        true
    }

    fn local(&self) -> bool {
        true
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MnemoError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_semaphore_caps_concurrency_at_two() {
    let gauged = GaugedLocal::new();
    let mgr = EmbedManager::with_chain(vec![gauged.clone()], test_store());

    let mut handles = Vec::new();
    for i in 0..8 {
        let mgr = Arc::clone(&mgr);
        handles.push(tokio::spawn(async move {
            mgr.embed_one(&format!("distinct text {i}")).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(
        gauged.peak.load(Ordering::SeqCst) <= 2,
        "local tier must never run more than 2 calls at once, saw {}",
        gauged.peak.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn config_built_chain_skips_unconfigured_clouds() {
    // No cloud credentials anywhere: every strategy bottoms out at local
    // without a single network attempt.
    let cfg = Config {
        embed_api_key: String::new(),
        cf_account_id: String::new(),
        cf_api_token: String::new(),
        strategy: EmbedStrategy::CloudFirst,
        ..Config::default()
    };
    let store = test_store();
    let mgr = EmbedManager::new(&cfg, &store);
    let (vector, provider) = mgr.embed_one("fully offline host").await.unwrap();
    assert_eq!(provider, "local");
    assert_eq!(vector.len(), LOCAL_DIM);

    let cfg = Config { strategy: EmbedStrategy::AccuracyFirst, ..cfg };
    let mgr = EmbedManager::new(&cfg, &store);
    let (_, provider) = mgr.embed_one("still offline").await.unwrap();
    assert_eq!(provider, "local");
}

#[test]
fn content_hash_is_stable_and_distinct() {
    assert_eq!(content_hash("abc"), content_hash("abc"));
    assert_ne!(content_hash("abc"), content_hash("abd"));
    assert_eq!(content_hash("abc").len(), 64);
}

#[test]
fn vector_bytes_roundtrip() {
    let v = vec![0.5f32, -1.25, 3.75, 0.0];
    assert_eq!(bytes_to_vector(&vector_to_bytes(&v)), v);
    assert!(bytes_to_vector(&[]).is_empty());
}
