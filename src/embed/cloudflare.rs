//! Cloudflare Workers AI embedding provider (primary cloud).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::EmbedProvider;
use crate::config::Config;
use crate::error::MnemoError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CloudflareProvider {
    api_base: String,
    account_id: String,
    api_token: String,
    model: String,
    client: reqwest::Client,
}

impl CloudflareProvider {
    pub fn new(cfg: &Config) -> Self {
        Self {
            api_base: cfg.cf_api_base.trim_end_matches('/').to_string(),
            account_id: cfg.cf_account_id.clone(),
            api_token: cfg.cf_api_token.clone(),
            model: cfg.cf_model.clone(),
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
struct CfRequest<'a> {
    text: &'a [String],
}

#[derive(Deserialize)]
struct CfResponse {
    #[serde(default)]
    result: CfResult,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Deserialize, Default)]
struct CfResult {
    #[serde(default)]
    data: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbedProvider for CloudflareProvider {
    fn name(&self) -> &'static str {
        "cloudflare"
    }

    fn configured(&self) -> bool {
        !self.account_id.is_empty() && !self.api_token.is_empty()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MnemoError> {
        let url = format!(
            "{}/accounts/{}/ai/run/{}",
            self.api_base, self.account_id, self.model
        );

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&CfRequest { text: texts })
            .send()
            .await
            .map_err(|e| self.err(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(self.err(format!("API returned {status}: {body}")));
        }

        let cf: CfResponse = resp
            .json()
            .await
            .map_err(|e| self.err(format!("response parse failed: {e}")))?;

        if !cf.errors.is_empty() {
            return Err(self.err(format!("API errors: {:?}", cf.errors)));
        }
        if cf.result.data.is_empty() {
            return Err(self.err("empty embedding response"));
        }
        if cf.result.data.len() != texts.len() {
            return Err(self.err(format!(
                "returned {} embeddings, expected {}",
                cf.result.data.len(),
                texts.len()
            )));
        }

        Ok(cf.result.data)
    }
}
