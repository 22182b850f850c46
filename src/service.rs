//! The memory service: composes the metadata store, the vector store and the
//! embedding manager under multi-tenant isolation. This is the surface the
//! (out-of-scope) transport layer talks to.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{now_ms, Kind, Memory, MetaStore, Status};
use crate::embed::EmbedManager;
use crate::error::MnemoError;
use crate::llm::LlmClient;
use crate::vecstore::{EmbeddingSource, VectorStore};
use crate::{store_call, SharedStore};

/// Content longer than this gets an LLM summary before embedding (when the
/// summarizer is enabled).
const SUMMARY_THRESHOLD_CHARS: usize = 200;

const DEFAULT_TOP_K: usize = 5;
const MAX_TOP_K: usize = 100;
const DEFAULT_MATCH_THRESHOLD: f32 = 0.85;
/// Batch cap when a semantic delete sweeps for related records.
const DELETE_SCAN_TOP_K: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct AddRequest {
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub kind: Option<Kind>,
}

impl AddRequest {
    pub fn new(user_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), content: content.into(), ..Default::default() }
    }

    pub fn kind(mut self, k: Kind) -> Self {
        self.kind = Some(k);
        self
    }

    pub fn source(mut self, s: impl Into<String>) -> Self {
        self.source = Some(s.into());
        self
    }

    pub fn session(mut self, s: impl Into<String>) -> Self {
        self.session_id = Some(s.into());
        self
    }

    pub fn tags(mut self, t: Vec<String>) -> Self {
        self.tags = Some(t);
        self
    }
}

/// "Remember this, and don't double-store": semantic-deletes near matches,
/// resurrects a supplied id, or falls back to a fresh insert.
#[derive(Debug, Default, Deserialize)]
pub struct SetRequest {
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub kind: Option<Kind>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub match_query: Option<String>,
    #[serde(default)]
    pub match_threshold: Option<f32>,
}

impl SetRequest {
    pub fn new(user_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), content: content.into(), ..Default::default() }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn kind(mut self, k: Kind) -> Self {
        self.kind = Some(k);
        self
    }

    pub fn source(mut self, s: impl Into<String>) -> Self {
        self.source = Some(s.into());
        self
    }

    pub fn tags(mut self, t: Vec<String>) -> Self {
        self.tags = Some(t);
        self
    }

    pub fn match_query(mut self, q: impl Into<String>) -> Self {
        self.match_query = Some(q.into());
        self
    }

    pub fn match_threshold(mut self, t: f32) -> Self {
        self.match_threshold = Some(t);
        self
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateRequest {
    pub content: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub user_id: String,
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl SearchRequest {
    pub fn new(user_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), query: query.into(), top_k: None, session_id: None }
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }

    pub fn session(mut self, s: impl Into<String>) -> Self {
        self.session_id = Some(s.into());
        self
    }
}

/// One recall hit. Higher score = higher priority; the tier is the primary
/// signal (preferences 1.0, summaries 0.95, fallback 0.7, then raw vector
/// similarity).
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub memory: Memory,
    pub score: f32,
}

#[derive(Debug, Serialize)]
pub struct ServiceStats {
    pub total_active: i64,
    pub total_deleted: i64,
    pub kind_counts: HashMap<String, i64>,
    pub max_count: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthInfo {
    pub status: String,
    pub memory_count: i64,
    pub version: String,
}

pub struct MemoryService {
    pub(crate) cfg: Config,
    pub(crate) store: SharedStore,
    pub(crate) vectors: Arc<VectorStore>,
    pub(crate) embed: Arc<EmbedManager>,
    pub(crate) llm: LlmClient,
}

impl MemoryService {
    pub fn new(
        cfg: Config,
        store: SharedStore,
        vectors: Arc<VectorStore>,
        embed: Arc<EmbedManager>,
    ) -> Self {
        let llm = LlmClient::new(&cfg);
        Self { cfg, store, vectors, embed, llm }
    }

    /// Wire up the whole engine from configuration: metadata store, embedding
    /// manager (with its startup health probe) and vector index.
    pub async fn open(cfg: Config) -> Result<Arc<Self>, MnemoError> {
        let store: SharedStore = Arc::new(MetaStore::open(&cfg.db_path)?);
        let embed = EmbedManager::new(&cfg, &store);
        let vectors = Arc::new(
            VectorStore::open(&cfg.vector_dir, embed.clone() as Arc<dyn EmbeddingSource>)
                .await?,
        );
        Ok(Arc::new(Self::new(cfg, store, vectors, embed)))
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Ingest a new memory. The metadata write is authoritative; a failed
    /// vector upsert is only a warning — the Healer repairs it later.
    pub async fn add(&self, req: AddRequest) -> Result<Memory, MnemoError> {
        let user_id = req.user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(MnemoError::EmptyUser);
        }
        let content = req.content.trim().to_string();
        if content.is_empty() {
            return Err(MnemoError::EmptyContent);
        }

        let summary = self.summarize_if_long(&content).await;
        let embedding_text =
            if summary.is_empty() { content.clone() } else { summary.clone() };
        let (vector, provider) = self.embed.embed_one(&embedding_text).await?;

        let now = now_ms();
        let mem = Memory {
            id: Uuid::new_v4().to_string(),
            user_id,
            session_id: req.session_id.unwrap_or_default(),
            content,
            summary,
            source: req.source.unwrap_or_default(),
            tags: req.tags.unwrap_or_default(),
            status: Status::Active,
            embed_provider: provider,
            kind: req.kind.unwrap_or(Kind::Conversation),
            access_count: 0,
            last_accessed_at: now,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        let record = mem.clone();
        store_call(&self.store, move |s| s.insert(&record)).await?;

        self.upsert_vector(&mem, &embedding_text, Some(vector)).await;
        Ok(mem)
    }

    /// Tiered recall: preferences, then keyword-filtered summaries (with a
    /// recent-conversation fallback), then vector neighbors. A shared seen-set
    /// keeps each record to its highest tier; tiers are never reordered.
    pub async fn search(&self, req: SearchRequest) -> Result<Vec<SearchResult>, MnemoError> {
        let user_id = req.user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(MnemoError::EmptyUser);
        }
        let query = req.query.trim().to_string();
        if query.is_empty() {
            return Err(MnemoError::EmptyQuery);
        }
        let top_k = req.top_k.unwrap_or(DEFAULT_TOP_K);
        if top_k == 0 || top_k > MAX_TOP_K {
            return Err(MnemoError::Validation(format!(
                "top_k must be between 1 and {MAX_TOP_K}"
            )));
        }

        let mut results: Vec<SearchResult> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        // Tier 1: preferences, fixed score 1.0. The store bumps their access
        // counters.
        let uid = user_id.clone();
        match store_call(&self.store, move |s| s.search_preferences(&uid, 6)).await {
            Ok(prefs) => {
                for p in prefs {
                    if seen.insert(p.id.clone()) {
                        results.push(SearchResult { memory: p, score: 1.0 });
                    }
                }
            }
            Err(e) => warn!(error = %e, "preference lookup failed"),
        }

        // Tier 2: keyword-filtered summaries at 0.95. A clean miss pads with
        // recent raw conversations at 0.7 (no access bump — filler, not a
        // hit). A failed keyword query skips the fallback.
        let keywords: Vec<String> = query.split_whitespace().map(str::to_string).collect();
        let uid = user_id.clone();
        match store_call(&self.store, move |s| {
            s.search_summaries_by_keywords(&uid, &keywords, 3)
        })
        .await
        {
            Ok(summaries) if !summaries.is_empty() => {
                for m in summaries {
                    if seen.insert(m.id.clone()) {
                        results.push(SearchResult { memory: m, score: 0.95 });
                    }
                }
            }
            Ok(_) => {
                let uid = user_id.clone();
                match store_call(&self.store, move |s| s.get_recent_conversations(&uid, 5)).await {
                    Ok(recent) => {
                        for m in recent {
                            if seen.insert(m.id.clone()) {
                                results.push(SearchResult { memory: m, score: 0.7 });
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "recent conversation fallback failed"),
                }
            }
            Err(e) => warn!(error = %e, "summary keyword lookup failed"),
        }

        // Tier 3: vector neighbors, scored by raw similarity. Preferences and
        // summaries already have dedicated tiers and are skipped here.
        let mut filter = HashMap::new();
        filter.insert("user_id".to_string(), user_id.clone());
        if let Some(sid) = req.session_id.as_deref().filter(|s| !s.is_empty()) {
            filter.insert("session_id".to_string(), sid.to_string());
        }
        match self.vectors.query(&query, top_k, &filter).await {
            Ok(matches) => {
                let score_map: HashMap<String, f32> =
                    matches.iter().map(|m| (m.id.clone(), m.similarity)).collect();
                let ids: Vec<String> = matches
                    .into_iter()
                    .map(|m| m.id)
                    .filter(|id| !seen.contains(id))
                    .collect();
                if !ids.is_empty() {
                    match store_call(&self.store, move |s| s.get_by_ids(&ids)).await {
                        Ok(fetched) => {
                            let mut hit_ids = Vec::new();
                            for m in fetched {
                                if matches!(m.kind, Kind::Preference | Kind::Summary) {
                                    continue;
                                }
                                let score = score_map.get(&m.id).copied().unwrap_or(0.0);
                                hit_ids.push(m.id.clone());
                                seen.insert(m.id.clone());
                                results.push(SearchResult { memory: m, score });
                            }
                            if !hit_ids.is_empty() {
                                let _ = store_call(&self.store, move |s| {
                                    for id in &hit_ids {
                                        s.bump_access(id)?;
                                    }
                                    Ok(())
                                })
                                .await;
                            }
                        }
                        Err(e) => warn!(error = %e, "vector hit hydration failed"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "vector recall failed"),
        }

        Ok(results)
    }

    /// Upsert with deduplication. Near matches of `match_query` are
    /// semantic-deleted first (optimistically — failures are warnings); a
    /// supplied id belonging to this tenant is resurrected and overwritten,
    /// anything else becomes a fresh insert.
    pub async fn set(&self, req: SetRequest) -> Result<Memory, MnemoError> {
        let user_id = req.user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(MnemoError::EmptyUser);
        }
        let content = req.content.trim().to_string();
        if content.is_empty() {
            return Err(MnemoError::EmptyContent);
        }

        let match_query = req
            .match_query
            .as_deref()
            .filter(|q| !q.trim().is_empty())
            .unwrap_or(&content)
            .to_string();
        let threshold = req.match_threshold.unwrap_or(DEFAULT_MATCH_THRESHOLD);

        if let Err(e) = self.delete_by_query(&user_id, &match_query, Some(threshold)).await {
            warn!(error = %e, "set: semantic dedup failed, continuing");
        }

        if let Some(id) = req.id.as_deref().filter(|s| !s.is_empty()) {
            let lookup = id.to_string();
            let existing =
                store_call(&self.store, move |s| s.get_by_id_with_deleted(&lookup)).await?;
            match existing {
                Some(mut mem) if mem.user_id == user_id => {
                    // Resurrect-and-replace: new content, new vector, cleared
                    // deleted_at — same id.
                    let summary = self.summarize_if_long(&content).await;
                    let embedding_text =
                        if summary.is_empty() { content.clone() } else { summary.clone() };
                    let (vector, provider) = self.embed.embed_one(&embedding_text).await?;

                    mem.content = content;
                    mem.summary = summary;
                    if let Some(src) = req.source.filter(|s| !s.is_empty()) {
                        mem.source = src;
                    }
                    if let Some(tags) = req.tags.filter(|t| !t.is_empty()) {
                        mem.tags = tags;
                    }
                    mem.embed_provider = provider;
                    mem.deleted_at = None;
                    mem.updated_at = now_ms();

                    let record = mem.clone();
                    store_call(&self.store, move |s| s.update_record(&record, true)).await?;

                    self.upsert_vector(&mem, &embedding_text, Some(vector)).await;
                    return Ok(mem);
                }
                Some(_) => {
                    debug!(id, "set: id belongs to another tenant, inserting fresh");
                }
                None => {}
            }
        }

        self.add(AddRequest {
            user_id,
            content,
            session_id: None,
            source: req.source,
            tags: req.tags,
            kind: req.kind,
        })
        .await
    }

    /// Strict-ID overwrite: fails with NotFound for missing or soft-deleted
    /// records; never resurrects.
    pub async fn update(&self, id: &str, req: UpdateRequest) -> Result<Memory, MnemoError> {
        let content = req.content.trim().to_string();
        if content.is_empty() {
            return Err(MnemoError::EmptyContent);
        }

        let lookup = id.to_string();
        let mut mem = store_call(&self.store, move |s| s.get_by_id(&lookup))
            .await?
            .ok_or(MnemoError::NotFound)?;

        let summary = self.summarize_if_long(&content).await;
        let embedding_text = if summary.is_empty() { content.clone() } else { summary.clone() };
        let (vector, provider) = self.embed.embed_one(&embedding_text).await?;

        mem.content = content;
        mem.summary = summary;
        if let Some(src) = req.source.filter(|s| !s.is_empty()) {
            mem.source = src;
        }
        if let Some(tags) = req.tags.filter(|t| !t.is_empty()) {
            mem.tags = tags;
        }
        mem.embed_provider = provider;
        mem.updated_at = now_ms();

        let record = mem.clone();
        store_call(&self.store, move |s| s.update_record(&record, false)).await?;

        self.upsert_vector(&mem, &embedding_text, Some(vector)).await;
        Ok(mem)
    }

    /// Soft-delete in metadata, hard-delete the vector. Idempotent: deleting
    /// an already-deleted record is a no-op, only unknown ids are NotFound.
    pub async fn delete(&self, id: &str) -> Result<(), MnemoError> {
        let lookup = id.to_string();
        let existing =
            store_call(&self.store, move |s| s.get_by_id_with_deleted(&lookup)).await?;
        if existing.is_none() {
            return Err(MnemoError::NotFound);
        }

        let target = id.to_string();
        store_call(&self.store, move |s| s.soft_delete(&target)).await?;
        self.vectors.delete(&[id.to_string()]).await;
        Ok(())
    }

    /// Semantic delete: soft-delete every recall hit scoring at or above the
    /// threshold. Returns how many were removed and their ids.
    pub async fn delete_by_query(
        &self,
        user_id: &str,
        query: &str,
        threshold: Option<f32>,
    ) -> Result<(usize, Vec<String>), MnemoError> {
        let threshold = threshold.unwrap_or(DEFAULT_MATCH_THRESHOLD);
        let results = self
            .search(SearchRequest {
                user_id: user_id.to_string(),
                query: query.to_string(),
                top_k: Some(DELETE_SCAN_TOP_K),
                session_id: None,
            })
            .await?;

        let ids: Vec<String> = results
            .into_iter()
            .filter(|r| r.score >= threshold)
            .map(|r| r.memory.id)
            .collect();
        if ids.is_empty() {
            return Ok((0, vec![]));
        }

        let batch = ids.clone();
        store_call(&self.store, move |s| s.soft_delete_batch(&batch)).await?;
        self.vectors.delete(&ids).await;
        Ok((ids.len(), ids))
    }

    pub async fn get_preferences(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Memory>, MnemoError> {
        let user_id = user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(MnemoError::EmptyUser);
        }
        let limit = limit.unwrap_or(6);
        store_call(&self.store, move |s| s.search_preferences(&user_id, limit)).await
    }

    /// List visible records, newest first.
    pub async fn list(
        &self,
        kind: Option<Kind>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Memory>, MnemoError> {
        let limit = limit.unwrap_or(50);
        let offset = offset.unwrap_or(0);
        store_call(&self.store, move |s| s.list(kind, limit, offset)).await
    }

    pub async fn stats(&self) -> Result<ServiceStats, MnemoError> {
        let stats = store_call(&self.store, |s| s.stats()).await?;
        Ok(ServiceStats {
            total_active: stats.total_active,
            total_deleted: stats.total_deleted,
            kind_counts: stats.kind_counts,
            max_count: self.cfg.max_memory_count,
        })
    }

    pub async fn count(&self) -> Result<i64, MnemoError> {
        store_call(&self.store, |s| s.count()).await
    }

    pub async fn health(&self) -> Result<HealthInfo, MnemoError> {
        let memory_count = self.count().await?;
        Ok(HealthInfo {
            status: "ok".into(),
            memory_count,
            version: env!("CARGO_PKG_VERSION").into(),
        })
    }

    /// Wait until every queued metadata write has been committed.
    pub async fn flush(&self) -> Result<(), MnemoError> {
        store_call(&self.store, |s| {
            s.flush();
            Ok(())
        })
        .await
    }

    /// Graceful shutdown: drain the write queue and stop the writer.
    pub async fn close(&self) -> Result<(), MnemoError> {
        store_call(&self.store, |s| {
            s.close();
            Ok(())
        })
        .await
    }

    /// Ask the LLM for a short factual summary of long content. Failure is
    /// never fatal — the raw content gets embedded instead.
    pub(crate) async fn summarize_if_long(&self, content: &str) -> String {
        if self.cfg.disable_summary || content.chars().count() <= SUMMARY_THRESHOLD_CHARS {
            return String::new();
        }
        match self.llm.summarize(content).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, "summary extraction failed, embedding raw content");
                String::new()
            }
        }
    }

    /// Vector writes ride behind the metadata commit and are allowed to fail;
    /// the record stays findable through the SQL tiers and the Healer (or the
    /// next overwrite) repairs the vector.
    pub(crate) async fn upsert_vector(&self, mem: &Memory, text: &str, vector: Option<Vec<f32>>) {
        if let Err(e) = self
            .vectors
            .upsert(&mem.id, text, vector_metadata(mem), vector)
            .await
        {
            warn!(id = %mem.id, error = %e, "vector upsert failed");
        }
    }
}

pub(crate) fn vector_metadata(mem: &Memory) -> HashMap<String, String> {
    let mut meta = HashMap::new();
    meta.insert("user_id".to_string(), mem.user_id.clone());
    meta.insert("session_id".to_string(), mem.session_id.clone());
    meta.insert("source".to_string(), mem.source.clone());
    meta.insert("kind".to_string(), mem.kind.as_str().to_string());
    meta
}
