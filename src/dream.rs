//! Dream: periodic LLM-driven consolidation of raw memory fragments into
//! facts, preferences and summaries, plus the budget/decay sweep that runs on
//! every tick regardless.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{now_ms, Kind, Memory, Status};
use crate::error::MnemoError;
use crate::prompts;
use crate::service::{MemoryService, SetRequest};
use crate::store_call;

/// Decay rule: conversations untouched this long with fewer hits than the
/// access floor get swept.
const EXPIRE_DAYS: i64 = 30;
const EXPIRE_MAX_ACCESS: i64 = 3;

/// The literal reply that means "no output this round".
const NOTHING_TO_CONSOLIDATE: &str = "NOTHING_TO_CONSOLIDATE";

/// Runs `run_dream` on a fixed interval.
pub struct DreamScheduler {
    service: Arc<MemoryService>,
    interval: Duration,
    handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DreamScheduler {
    pub fn new(service: Arc<MemoryService>) -> Self {
        let interval = service.config().dream.interval;
        Self { service, interval, handle: parking_lot::Mutex::new(None) }
    }

    /// Start the periodic loop (non-blocking). Calling twice is a no-op.
    pub fn start(&self) {
        let mut guard = self.handle.lock();
        if guard.is_some() {
            return;
        }
        let service = Arc::clone(&self.service);
        let interval = self.interval;
        info!(interval_secs = interval.as_secs(), "dream scheduler started");
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                debug!("scheduled dream cycle triggered");
                if let Err(e) = service.run_dream().await {
                    warn!(error = %e, "dream cycle failed");
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            info!("dream scheduler stopped");
        }
    }
}

impl Drop for DreamScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The structured document Dream expects back from the LLM.
#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct DreamOutput {
    #[serde(default)]
    pub consolidated: Vec<String>,
    #[serde(default)]
    pub preferences: Vec<DreamPreference>,
    #[serde(default)]
    pub facts: Vec<DreamFact>,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct DreamPreference {
    pub text: String,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct DreamFact {
    pub text: String,
    #[serde(default)]
    pub supersedes: Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum DreamReply {
    Nothing,
    Output(DreamOutput),
}

/// Turn a raw LLM reply into a consolidation plan. Pure so captured replies
/// can drive unit tests: strips Markdown fences, parses the JSON contract,
/// and on parse failure degrades to treating each non-bracket line as a
/// consolidated entry.
pub fn parse_dream_reply(raw: &str) -> DreamReply {
    let trimmed = raw.trim();
    if trimmed == NOTHING_TO_CONSOLIDATE {
        return DreamReply::Nothing;
    }

    let stripped = strip_fences(trimmed);
    if let Ok(output) = serde_json::from_str::<DreamOutput>(stripped) {
        return DreamReply::Output(output);
    }

    let mut output = DreamOutput::default();
    for line in stripped.lines() {
        let line = line.trim().trim_start_matches("- ").trim();
        if line.is_empty() || line.starts_with(['{', '[', '}', ']']) {
            continue;
        }
        output.consolidated.push(line.to_string());
    }
    DreamReply::Output(output)
}

fn strip_fences(s: &str) -> &str {
    let s = s.trim();
    let s = s.strip_prefix("```json").or_else(|| s.strip_prefix("```")).unwrap_or(s);
    let s = s.strip_suffix("```").unwrap_or(s);
    s.trim()
}

impl MemoryService {
    /// One consolidation cycle. Invoked by the scheduler and on demand
    /// (`trigger_dream` at the transport layer just spawns this).
    pub async fn run_dream(&self) -> Result<(), MnemoError> {
        // Budget and decay run even when Dream itself is disabled.
        let max = self.cfg.max_memory_count;
        if max > 0 {
            match store_call(&self.store, move |s| s.enforce_budget(max)).await {
                Ok(evicted) if evicted > 0 => {
                    info!(evicted, budget = max, "evicted low-value memories over budget")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "budget enforcement failed"),
            }
        }
        match store_call(&self.store, |s| {
            s.clean_expired_conversations(EXPIRE_DAYS, EXPIRE_MAX_ACCESS)
        })
        .await
        {
            Ok(expired) if expired > 0 => info!(expired, "swept expired conversations"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "expiry sweep failed"),
        }

        let dream_cfg = self.cfg.dream.clone();
        if !dream_cfg.enabled {
            debug!("dream disabled, maintenance sweep only");
            return Ok(());
        }

        let since = now_ms() - dream_cfg.window.as_millis() as i64;
        let max_items = dream_cfg.max_items;
        let memories =
            store_call(&self.store, move |s| s.get_recent_active(since, max_items)).await?;
        if memories.len() < dream_cfg.min_count {
            info!(found = memories.len(), min = dream_cfg.min_count, "too few memories, skipping dream");
            return Ok(());
        }
        let input_count = memories.len();
        info!(count = input_count, "dream cycle processing recent memories");

        let log_id = store_call(&self.store, move |s| s.log_dream_start(input_count)).await?;

        // Tenant isolation: consolidation never crosses user boundaries.
        let mut groups: BTreeMap<String, Vec<Memory>> = BTreeMap::new();
        for m in memories {
            groups.entry(m.user_id.clone()).or_default().push(m);
        }

        let system_prompt = if dream_cfg.prompt.is_empty() {
            prompts::DREAM_SYSTEM_PROMPT.to_string()
        } else {
            dream_cfg.prompt.clone()
        };
        let date_tag = Utc::now().format("%Y-%m-%d").to_string();

        let mut total_output = 0usize;
        let mut had_error = false;

        for (user_id, group) in &groups {
            let user_msg = build_dream_prompt(user_id, group);

            let reply = (|| {
                self.llm.chat_with(
                    &dream_cfg.llm_base,
                    &dream_cfg.llm_key,
                    &dream_cfg.llm_model,
                    &system_prompt,
                    &user_msg,
                )
            })
            .retry(ExponentialBuilder::default().with_max_times(3))
            .notify(|err: &MnemoError, dur: Duration| {
                warn!(error = %err, retry_after = ?dur, %user_id, "dream LLM call failed, retrying");
            })
            .await;

            let reply = match reply {
                Ok(r) => r,
                Err(e) => {
                    warn!(%user_id, error = %e, "dream LLM call failed for tenant");
                    had_error = true;
                    continue;
                }
            };

            let output = match parse_dream_reply(&reply) {
                DreamReply::Nothing => {
                    info!(%user_id, "nothing worth consolidating");
                    continue;
                }
                DreamReply::Output(output) => output,
            };

            total_output += self.apply_dream_output(user_id, output, &date_tag).await;

            let ids: Vec<String> = group.iter().map(|m| m.id.clone()).collect();
            if let Err(e) = store_call(&self.store, move |s| s.mark_consolidated(&ids)).await {
                warn!(%user_id, error = %e, "failed to mark consolidated inputs");
                had_error = true;
            }
        }

        let error_msg = if had_error { "completed with some tenant errors" } else { "" };
        let msg = error_msg.to_string();
        store_call(&self.store, move |s| s.log_dream_finish(log_id, total_output, &msg)).await?;
        info!(input = input_count, output = total_output, "dream cycle complete");
        Ok(())
    }

    /// Persist one tenant's consolidation plan. Returns how many records were
    /// created; per-item failures are logged, not fatal.
    pub async fn apply_dream_output(
        &self,
        user_id: &str,
        output: DreamOutput,
        date_tag: &str,
    ) -> usize {
        let base_tags =
            vec!["dream".to_string(), "consolidated".to_string(), date_tag.to_string()];
        let mut created = 0usize;

        for text in output.consolidated {
            if self.insert_dream_record(user_id, &text, Kind::Summary, base_tags.clone()).await {
                created += 1;
            }
        }
        for pref in output.preferences {
            if self.insert_dream_record(user_id, &pref.text, Kind::Preference, base_tags.clone()).await
            {
                created += 1;
            }
        }
        for fact in output.facts {
            match fact.supersedes.as_deref().filter(|s| !s.trim().is_empty()) {
                Some(supersedes) => {
                    // Conflict resolution: overwrite whatever the superseded
                    // statement still matches.
                    let mut tags = base_tags.clone();
                    tags.push("conflict_resolved".to_string());
                    let req = SetRequest::new(user_id, fact.text.clone())
                        .match_query(supersedes)
                        .match_threshold(0.75)
                        .kind(Kind::Fact)
                        .source("dream")
                        .tags(tags);
                    match self.set(req).await {
                        Ok(_) => created += 1,
                        Err(e) => {
                            warn!(user_id, error = %e, "dream fact overwrite failed")
                        }
                    }
                }
                None => {
                    if self.insert_dream_record(user_id, &fact.text, Kind::Fact, base_tags.clone()).await
                    {
                        created += 1;
                    }
                }
            }
        }

        created
    }

    /// Kick off a consolidation cycle in the background, without waiting for
    /// it. Errors are logged, never surfaced to the caller.
    pub fn trigger_dream(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = service.run_dream().await {
                warn!(error = %e, "triggered dream cycle failed");
            }
        });
    }

    /// Recent maintenance-log rows, newest first.
    pub async fn dream_log(
        &self,
        limit: usize,
    ) -> Result<Vec<crate::db::DreamLogEntry>, MnemoError> {
        store_call(&self.store, move |s| s.dream_log_recent(limit)).await
    }

    /// Direct insert of a Dream-produced record (status `dream`), bypassing
    /// the dedup machinery of `set`.
    async fn insert_dream_record(
        &self,
        user_id: &str,
        content: &str,
        kind: Kind,
        tags: Vec<String>,
    ) -> bool {
        let content = content.trim();
        if content.is_empty() {
            return false;
        }

        let (vector, provider) = match self.embed.embed_one(content).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(user_id, error = %e, "dream record embedding failed");
                return false;
            }
        };

        let now = now_ms();
        let mem = Memory {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            session_id: String::new(),
            content: content.to_string(),
            summary: String::new(),
            source: "dream".to_string(),
            tags,
            status: Status::Dream,
            embed_provider: provider,
            kind,
            access_count: 0,
            last_accessed_at: now,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        let record = mem.clone();
        if let Err(e) = store_call(&self.store, move |s| s.insert(&record)).await {
            warn!(user_id, error = %e, "dream record insert failed");
            return false;
        }
        self.upsert_vector(&mem, content, Some(vector)).await;
        true
    }
}

/// Chronological fragment listing the LLM consolidates from.
fn build_dream_prompt(user_id: &str, memories: &[Memory]) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(
        out,
        "The following are {} raw memory fragments collected from user '{}'. Please consolidate them:\n",
        memories.len(),
        user_id
    );
    for (i, m) in memories.iter().enumerate() {
        let ts = Utc
            .timestamp_millis_opt(m.created_at)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let _ = writeln!(out, "[{}] ({}) {}", i + 1, ts, m.content);
    }
    out
}
