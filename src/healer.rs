//! Healer: promotes records still stamped with the local fallback provider to
//! high-quality cloud vectors once a cloud provider is reachable. Its forced
//! cloud call is also what clears a provider's DOWN flag, so the 5-minute
//! cadence doubles as the health-recovery probe.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::MnemoError;
use crate::service::{vector_metadata, MemoryService};
use crate::store_call;

const HEAL_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Per-tick cap, sized to stay under cloud provider rate limits.
const HEAL_BATCH: usize = 50;

pub struct HealerScheduler {
    service: Arc<MemoryService>,
    handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HealerScheduler {
    pub fn new(service: Arc<MemoryService>) -> Self {
        Self { service, handle: parking_lot::Mutex::new(None) }
    }

    /// Start the periodic loop (non-blocking). Calling twice is a no-op.
    pub fn start(&self) {
        let mut guard = self.handle.lock();
        if guard.is_some() {
            return;
        }
        let service = Arc::clone(&self.service);
        info!(interval_secs = HEAL_INTERVAL.as_secs(), "healer scheduler started");
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEAL_INTERVAL).await;
                if let Err(e) = service.run_heal().await {
                    warn!(error = %e, "heal cycle failed");
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            info!("healer scheduler stopped");
        }
    }
}

impl Drop for HealerScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl MemoryService {
    /// One heal pass. Returns how many records were promoted. Idempotent —
    /// re-promoting an already-healed record is a no-op overwrite.
    pub async fn run_heal(&self) -> Result<usize, MnemoError> {
        let memories =
            store_call(&self.store, |s| s.get_local_memories(HEAL_BATCH)).await?;
        if memories.is_empty() {
            return Ok(0);
        }
        info!(count = memories.len(), "healer found local-embedded memories");

        // The stored vector always corresponds to the summary when one exists.
        let texts: Vec<String> =
            memories.iter().map(|m| m.embedding_text().to_string()).collect();

        let (vectors, provider) = match self.embed.force_cloud_batch(&texts).await {
            Ok(result) => result,
            Err(e) => {
                // Cloud still unreachable — wait for the next tick.
                info!(error = %e, "healer: cloud providers unavailable, skipping this round");
                return Ok(0);
            }
        };

        let mut healed = 0usize;
        for (mem, vector) in memories.iter().zip(vectors) {
            if let Err(e) = self
                .vectors
                .upsert(&mem.id, mem.embedding_text(), vector_metadata(mem), Some(vector))
                .await
            {
                warn!(id = %mem.id, error = %e, "healer: vector upsert failed");
                continue;
            }
            let id = mem.id.clone();
            let stamp = provider.clone();
            if let Err(e) =
                store_call(&self.store, move |s| s.update_provider(&id, &stamp)).await
            {
                warn!(id = %mem.id, error = %e, "healer: provider restamp failed");
                continue;
            }
            healed += 1;
        }

        info!(healed, total = memories.len(), provider = %provider, "heal cycle complete");
        Ok(healed)
    }
}
