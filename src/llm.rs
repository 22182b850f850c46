//! OpenAI-compatible chat client, used for summarization and Dream.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::MnemoError;
use crate::prompts;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct LlmClient {
    api_base: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlmClient {
    pub fn new(cfg: &Config) -> Self {
        Self {
            api_base: cfg.llm_api_base.trim_end_matches('/').to_string(),
            api_key: cfg.llm_api_key.clone(),
            model: cfg.llm_model.clone(),
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    /// Send a chat completion with the default endpoint and model.
    pub async fn chat(&self, system: &str, user: &str) -> Result<String, MnemoError> {
        self.chat_with("", "", "", system, user).await
    }

    /// Send a chat completion; non-empty overrides replace the configured
    /// base/key/model for this call. Dream uses this for its per-job LLM.
    pub async fn chat_with(
        &self,
        base_override: &str,
        key_override: &str,
        model_override: &str,
        system: &str,
        user: &str,
    ) -> Result<String, MnemoError> {
        let base = if base_override.is_empty() {
            self.api_base.as_str()
        } else {
            base_override.trim_end_matches('/')
        };
        let key = if key_override.is_empty() { self.api_key.as_str() } else { key_override };
        let model = if model_override.is_empty() { self.model.as_str() } else { model_override };

        let req = ChatRequest {
            model,
            messages: vec![
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: user },
            ],
            temperature: 0.1,
        };

        let url = format!("{base}/chat/completions");
        let mut builder = self.client.post(&url).json(&req);
        if !key.is_empty() {
            builder = builder.bearer_auth(key);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| MnemoError::Llm(format!("request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(MnemoError::Llm(format!("LLM returned {status}: {body}")));
        }

        let chat: ChatResponse = resp
            .json()
            .await
            .map_err(|e| MnemoError::Llm(format!("response parse failed: {e}")))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| MnemoError::Llm("empty LLM response".into()))
    }

    /// Distill long content into a short factual summary for embedding.
    /// An empty reply means nothing was worth keeping.
    pub async fn summarize(&self, content: &str) -> Result<String, MnemoError> {
        let reply = self.chat(prompts::SUMMARIZE_SYSTEM_PROMPT, content).await?;
        Ok(reply.trim().to_string())
    }
}
