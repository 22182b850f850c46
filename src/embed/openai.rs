//! OpenAI-compatible embedding provider (alternate cloud). Works with any
//! endpoint speaking the `/embeddings` wire shape.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::EmbedProvider;
use crate::config::Config;
use crate::error::MnemoError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OpenAiProvider {
    api_base: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(cfg: &Config) -> Self {
        Self {
            api_base: cfg.embed_api_base.trim_end_matches('/').to_string(),
            api_key: cfg.embed_api_key.clone(),
            model: cfg.embed_model.clone(),
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    fn err(&self, msg: impl Into<String>) -> MnemoError {
        MnemoError::Provider(self.name().into(), msg.into())
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

#[async_trait]
impl EmbedProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn configured(&self) -> bool {
        !self.api_base.is_empty() && !self.api_key.is_empty()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MnemoError> {
        let url = format!("{}/embeddings", self.api_base);
        let req = EmbedRequest { model: &self.model, input: texts };

        let mut builder = self.client.post(&url).json(&req);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| self.err(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(self.err(format!("API returned {status}: {body}")));
        }

        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| self.err(format!("response parse failed: {e}")))?;

        if parsed.data.is_empty() {
            return Err(self.err("empty embedding response"));
        }
        if parsed.data.len() != texts.len() {
            return Err(self.err(format!(
                "returned {} embeddings, expected {}",
                parsed.data.len(),
                texts.len()
            )));
        }

        // Order by the reported index when present; servers usually return
        // in request order but the contract allows otherwise.
        let mut out: Vec<Vec<f32>> = vec![Vec::new(); texts.len()];
        for (pos, item) in parsed.data.into_iter().enumerate() {
            let idx = item.index.unwrap_or(pos);
            if idx >= out.len() {
                return Err(self.err(format!("embedding index {idx} out of range")));
            }
            out[idx] = item.embedding;
        }
        Ok(out)
    }
}
