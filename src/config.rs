//! Service configuration. The engine receives these values already parsed;
//! `Config::from_env` is a convenience for the embedding binary or tests.

use std::time::Duration;

/// Provider chain selection policy. Closed set — `local` is always last in
/// every chain it appears in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbedStrategy {
    /// Cloudflare first, then the OpenAI-compatible endpoint, then local.
    #[default]
    CloudFirst,
    /// OpenAI-compatible endpoint first, then Cloudflare, then local.
    AccuracyFirst,
    /// Local fallback only. Used by tests and fully offline hosts.
    LocalOnly,
}

impl EmbedStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbedStrategy::CloudFirst => "cloud_first",
            EmbedStrategy::AccuracyFirst => "accuracy_first",
            EmbedStrategy::LocalOnly => "local_only",
        }
    }

    /// Parse a strategy name; unknown values fall back to `cloud_first`.
    pub fn parse(s: &str) -> Self {
        match s {
            "accuracy_first" => EmbedStrategy::AccuracyFirst,
            "local_only" => EmbedStrategy::LocalOnly,
            _ => EmbedStrategy::CloudFirst,
        }
    }
}

/// Dream (memory consolidation) settings.
#[derive(Debug, Clone)]
pub struct DreamConfig {
    pub enabled: bool,
    /// How often the scheduler fires.
    pub interval: Duration,
    /// Only memories created within this window are consolidated.
    pub window: Duration,
    /// Skip the run when fewer records than this are found.
    pub min_count: usize,
    /// Cap on records consumed per run.
    pub max_items: usize,
    /// Per-job LLM overrides; empty = reuse the global LLM settings.
    pub llm_base: String,
    pub llm_key: String,
    pub llm_model: String,
    /// Custom system prompt; empty = built-in.
    pub prompt: String,
}

impl Default for DreamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(24 * 3600),
            window: Duration::from_secs(24 * 3600),
            min_count: 10,
            max_items: 200,
            llm_base: String::new(),
            llm_key: String::new(),
            llm_model: String::new(),
            prompt: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file path (`:memory:` supported for tests).
    pub db_path: String,
    /// Directory owned by the vector index.
    pub vector_dir: String,

    /// OpenAI-compatible embedding endpoint (alternate cloud provider).
    pub embed_api_base: String,
    pub embed_api_key: String,
    pub embed_model: String,

    /// Cloudflare Workers AI (primary cloud provider).
    pub cf_api_base: String,
    pub cf_account_id: String,
    pub cf_api_token: String,
    pub cf_model: String,

    /// Chat LLM used for summarization and Dream.
    pub llm_api_base: String,
    pub llm_api_key: String,
    pub llm_model: String,

    /// Skip LLM summarization of long content (default true to save cost).
    pub disable_summary: bool,

    pub strategy: EmbedStrategy,

    /// Budget of visible records before forced eviction. 0 disables.
    pub max_memory_count: usize,

    pub dream: DreamConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "./data/mnemo.db".into(),
            vector_dir: "./data/vectors".into(),
            embed_api_base: "https://api.openai.com/v1".into(),
            embed_api_key: String::new(),
            embed_model: "text-embedding-3-small".into(),
            cf_api_base: "https://api.cloudflare.com/client/v4".into(),
            cf_account_id: String::new(),
            cf_api_token: String::new(),
            cf_model: "@cf/baai/bge-base-en-v1.5".into(),
            llm_api_base: "https://api.openai.com/v1".into(),
            llm_api_key: String::new(),
            llm_model: "gpt-4o-mini".into(),
            disable_summary: true,
            strategy: EmbedStrategy::default(),
            max_memory_count: 5000,
            dream: DreamConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `MNEMO_*` environment variables, falling back
    /// to the defaults above.
    pub fn from_env() -> Self {
        let d = Config::default();
        let dream_defaults = DreamConfig::default();
        Self {
            db_path: env_or("MNEMO_DB_PATH", &d.db_path),
            vector_dir: env_or("MNEMO_VECTOR_DIR", &d.vector_dir),
            embed_api_base: env_or("MNEMO_EMBED_API_BASE", &d.embed_api_base),
            embed_api_key: env_or("MNEMO_EMBED_API_KEY", ""),
            embed_model: env_or("MNEMO_EMBED_MODEL", &d.embed_model),
            cf_api_base: env_or("MNEMO_CF_API_BASE", &d.cf_api_base),
            cf_account_id: env_or("MNEMO_CF_ACCOUNT_ID", ""),
            cf_api_token: env_or("MNEMO_CF_API_TOKEN", ""),
            cf_model: env_or("MNEMO_CF_MODEL", &d.cf_model),
            llm_api_base: env_or("MNEMO_LLM_API_BASE", &d.llm_api_base),
            llm_api_key: env_or("MNEMO_LLM_API_KEY", ""),
            llm_model: env_or("MNEMO_LLM_MODEL", &d.llm_model),
            disable_summary: env_bool("MNEMO_DISABLE_LLM_SUMMARY", true),
            strategy: EmbedStrategy::parse(&env_or("MNEMO_EMBEDDING_STRATEGY", "cloud_first")),
            max_memory_count: env_usize("MNEMO_MAX_MEMORY_COUNT", 5000),
            dream: DreamConfig {
                enabled: env_bool("MNEMO_DREAM_ENABLED", false),
                interval: Duration::from_secs(env_u64("MNEMO_DREAM_INTERVAL_MINS", 24 * 60) * 60),
                window: Duration::from_secs(env_u64("MNEMO_DREAM_WINDOW_MINS", 24 * 60) * 60),
                min_count: env_usize("MNEMO_DREAM_MIN_COUNT", dream_defaults.min_count),
                max_items: env_usize("MNEMO_DREAM_MAX_ITEMS", dream_defaults.max_items),
                llm_base: env_or("MNEMO_DREAM_LLM_BASE", ""),
                llm_key: env_or("MNEMO_DREAM_LLM_KEY", ""),
                llm_model: env_or("MNEMO_DREAM_LLM_MODEL", ""),
                prompt: env_or("MNEMO_DREAM_PROMPT", ""),
            },
        }
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| fallback.to_string())
}

fn env_bool(key: &str, fallback: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        })
        .unwrap_or(fallback)
}

fn env_usize(key: &str, fallback: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(fallback)
}

fn env_u64(key: &str, fallback: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(fallback)
}
