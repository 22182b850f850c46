//! Deterministic local fallback embedder.
//!
//! Produces digest-derived pseudo-vectors: lossy, but always available and
//! stable — identical text yields identical vectors, so exact-duplicate
//! detection and cache lookups keep working with no network at all. The
//! Healer replaces these vectors with real ones once a cloud provider
//! returns.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::EmbedProvider;
use crate::error::MnemoError;

pub const LOCAL_DIM: usize = 384;

pub struct LocalProvider;

impl LocalProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbedProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn configured(&self) -> bool {
        true
    }

    fn local(&self) -> bool {
        true
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MnemoError> {
        Ok(texts.iter().map(|t| pseudo_vector(t)).collect())
    }
}

/// Expand a SHA-256 digest chain over the text into a unit vector.
fn pseudo_vector(text: &str) -> Vec<f32> {
    let mut out = Vec::with_capacity(LOCAL_DIM);
    let mut counter: u32 = 0;
    while out.len() < LOCAL_DIM {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(counter.to_le_bytes());
        let digest = hasher.finalize();
        for chunk in digest.chunks_exact(4) {
            if out.len() == LOCAL_DIM {
                break;
            }
            let arr: [u8; 4] = chunk.try_into().expect("4 bytes");
            let bits = u32::from_le_bytes(arr);
            // map to [-1, 1)
            out.push((bits as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32);
        }
        counter += 1;
    }
    l2_normalize(&mut out);
    out
}

fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}
