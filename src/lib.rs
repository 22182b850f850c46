//! mnemo — single-node long-term memory engine for AI agents.
//!
//! Memories are tenant-scoped text records in SQLite; vectors come from a
//! tiered embedding provider chain with a persistent cache and land in a
//! brute-force cosine index on disk. Two background jobs keep the store
//! healthy: Dream consolidates noisy fragments into facts and preferences,
//! the Healer rewrites locally-embedded vectors once a cloud provider is
//! reachable again.

pub mod config;
pub mod db;
pub mod dream;
pub mod embed;
pub mod error;
pub mod healer;
pub mod llm;
pub mod prompts;
pub mod service;
pub mod vecstore;

use std::sync::Arc;

pub type SharedStore = Arc<db::MetaStore>;

/// Run a blocking metadata-store operation on tokio's blocking thread pool.
///
/// All synchronous MetaStore calls in async context MUST go through this
/// to avoid starving tokio worker threads.
pub async fn store_call<F, T>(store: &SharedStore, f: F) -> Result<T, error::MnemoError>
where
    F: FnOnce(&db::MetaStore) -> Result<T, error::MnemoError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| error::MnemoError::Internal(e.to_string()))?
}
