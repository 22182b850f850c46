//! Memory record operations, the embedding cache table, and the Dream log.

use std::collections::HashMap;

use rusqlite::params;

use super::*;
use crate::embed::{bytes_to_vector, vector_to_bytes};

/// Explicit column list so every query maps through the same row reader.
const COLS: &str = "id, user_id, session_id, content, summary, source, tags, status, \
    embed_provider, kind, access_count, last_accessed_at, created_at, updated_at, deleted_at";

impl MetaStore {
    /// Queue a new record for insertion. Falls back to a synchronous write
    /// when the queue is saturated.
    pub fn insert(&self, mem: &Memory) -> Result<(), MnemoError> {
        self.enqueue(WriteOp::Insert(Box::new(mem.clone())))
    }

    /// Queue an access-count bump with a `last_accessed_at` refresh.
    pub fn bump_access(&self, id: &str) -> Result<(), MnemoError> {
        self.enqueue(WriteOp::BumpAccess(id.to_string()))
    }

    /// Fetch a visible record by id.
    pub fn get_by_id(&self, id: &str) -> Result<Option<Memory>, MnemoError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLS} FROM memories WHERE id = ?1 AND deleted_at IS NULL"
        ))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_memory(row)?)),
            None => Ok(None),
        }
    }

    /// Fetch a record by id, including soft-deleted ones. Used by the
    /// resurrect path of `set`.
    pub fn get_by_id_with_deleted(&self, id: &str) -> Result<Option<Memory>, MnemoError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {COLS} FROM memories WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_memory(row)?)),
            None => Ok(None),
        }
    }

    /// Batch fetch of visible records. Missing and soft-deleted ids are
    /// silently absent from the result.
    pub fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Memory>, MnemoError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLS} FROM memories WHERE id IN ({placeholders}) AND deleted_at IS NULL"
        ))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), row_to_memory)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count of visible records.
    pub fn count(&self) -> Result<i64, MnemoError> {
        let conn = self.conn()?;
        let n = conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL",
            [],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    pub fn stats(&self) -> Result<StoreStats, MnemoError> {
        let conn = self.conn()?;
        let total_active: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL",
            [],
            |r| r.get(0),
        )?;
        let total_deleted: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE deleted_at IS NOT NULL",
            [],
            |r| r.get(0),
        )?;

        let mut kind_counts = HashMap::new();
        let mut stmt = conn.prepare(
            "SELECT kind, COUNT(*) FROM memories WHERE deleted_at IS NULL GROUP BY kind",
        )?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (kind, count) = row?;
            kind_counts.insert(kind, count);
        }

        Ok(StoreStats { total_active, total_deleted, kind_counts })
    }

    /// List visible records, newest first, optionally filtered by kind.
    pub fn list(
        &self,
        kind: Option<Kind>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Memory>, MnemoError> {
        let limit = if limit == 0 { 50 } else { limit };
        let conn = self.conn()?;
        let rows = match kind {
            Some(k) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLS} FROM memories WHERE deleted_at IS NULL AND kind = ?1 \
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
                ))?;
                let result = stmt
                    .query_map(params![k.as_str(), limit as i64, offset as i64], row_to_memory)?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLS} FROM memories WHERE deleted_at IS NULL \
                     ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
                ))?;
                let result = stmt
                    .query_map(params![limit as i64, offset as i64], row_to_memory)?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            }
        };
        Ok(rows)
    }

    /// Soft-delete a record. Set-once: a second call on the same id is a
    /// no-op, not an error.
    pub fn soft_delete(&self, id: &str) -> Result<(), MnemoError> {
        let now = now_ms();
        self.conn()?.execute(
            "UPDATE memories SET deleted_at = ?1, updated_at = ?1 \
             WHERE id = ?2 AND deleted_at IS NULL",
            params![now, id],
        )?;
        Ok(())
    }

    pub fn soft_delete_batch(&self, ids: &[String]) -> Result<(), MnemoError> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let now = now_ms();
        let mut args: Vec<&dyn rusqlite::ToSql> = vec![&now];
        for id in ids {
            args.push(id);
        }
        self.conn()?.execute(
            &format!(
                "UPDATE memories SET deleted_at = ?1, updated_at = ?1 \
                 WHERE id IN ({placeholders}) AND deleted_at IS NULL"
            ),
            args.as_slice(),
        )?;
        Ok(())
    }

    /// Overwrite the mutable fields of a record. With `restore` the record is
    /// also resurrected (`deleted_at` cleared).
    pub fn update_record(&self, m: &Memory, restore: bool) -> Result<(), MnemoError> {
        let tags_json = serde_json::to_string(&m.tags).unwrap_or_else(|_| "[]".into());
        let restore_clause = if restore { ", deleted_at = NULL" } else { "" };
        self.conn()?.execute(
            &format!(
                "UPDATE memories SET content = ?1, summary = ?2, source = ?3, tags = ?4, \
                 status = ?5, embed_provider = ?6, kind = ?7, updated_at = ?8{restore_clause} \
                 WHERE id = ?9"
            ),
            params![
                m.content,
                m.summary,
                m.source,
                tags_json,
                m.status.as_str(),
                m.embed_provider,
                m.kind.as_str(),
                now_ms(),
                m.id,
            ],
        )?;
        Ok(())
    }

    /// Active records created since the given instant, oldest first. Feeds
    /// the Dream consolidator; results are not tenant-filtered and MUST be
    /// grouped by `user_id` before processing.
    pub fn get_recent_active(&self, since_ms: i64, limit: usize) -> Result<Vec<Memory>, MnemoError> {
        let limit = if limit == 0 { 200 } else { limit };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLS} FROM memories \
             WHERE status = 'active' AND created_at >= ?1 AND deleted_at IS NULL \
             ORDER BY created_at ASC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![since_ms, limit as i64], row_to_memory)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Tenant preferences, newest updated first. Every returned row counts as
    /// a recall hit and gets its access counter bumped.
    pub fn search_preferences(&self, user_id: &str, limit: usize) -> Result<Vec<Memory>, MnemoError> {
        let limit = if limit == 0 { 6 } else { limit };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLS} FROM memories \
             WHERE user_id = ?1 AND kind = 'preference' AND status = 'active' \
               AND deleted_at IS NULL \
             ORDER BY updated_at DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], row_to_memory)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);
        for m in &rows {
            let _ = self.bump_access(&m.id);
        }
        Ok(rows)
    }

    /// Summary pre-filter: disjunctive case-sensitive substring match on
    /// `content` or `summary`. Empty keyword list matches nothing — the
    /// recall path treats that as a miss and falls back.
    pub fn search_summaries_by_keywords(
        &self,
        user_id: &str,
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<Memory>, MnemoError> {
        if keywords.is_empty() {
            return Ok(vec![]);
        }
        let limit = if limit == 0 { 3 } else { limit };

        let mut sql = format!(
            "SELECT {COLS} FROM memories \
             WHERE user_id = ?1 AND kind = 'summary' AND status = 'active' \
               AND deleted_at IS NULL AND ("
        );
        let mut args: Vec<String> = vec![user_id.to_string()];
        for (i, kw) in keywords.iter().enumerate() {
            if i > 0 {
                sql.push_str(" OR ");
            }
            sql.push_str("(content LIKE ? OR summary LIKE ?)");
            let pat = format!("%{kw}%");
            args.push(pat.clone());
            args.push(pat);
        }
        sql.push_str(&format!(") ORDER BY updated_at DESC LIMIT {limit}"));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), row_to_memory)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);
        for m in &rows {
            let _ = self.bump_access(&m.id);
        }
        Ok(rows)
    }

    /// Most recent raw conversations for a tenant. Fallback filler for the
    /// summary tier — hits are NOT counted as accesses.
    pub fn get_recent_conversations(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Memory>, MnemoError> {
        let limit = if limit == 0 { 5 } else { limit };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLS} FROM memories \
             WHERE user_id = ?1 AND kind = 'conversation' AND status = 'active' \
               AND deleted_at IS NULL \
             ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], row_to_memory)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Visible active records still stamped with the local fallback provider,
    /// oldest first. The Healer's work list.
    pub fn get_local_memories(&self, limit: usize) -> Result<Vec<Memory>, MnemoError> {
        let limit = if limit == 0 { 50 } else { limit };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLS} FROM memories \
             WHERE status = 'active' AND embed_provider = 'local' AND deleted_at IS NULL \
             ORDER BY created_at ASC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_memory)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Restamp the provider after a Healer promotion.
    pub fn update_provider(&self, id: &str, provider: &str) -> Result<(), MnemoError> {
        self.conn()?.execute(
            "UPDATE memories SET embed_provider = ?1, updated_at = ?2 WHERE id = ?3",
            params![provider, now_ms(), id],
        )?;
        Ok(())
    }

    /// Mark Dream inputs as subsumed. They stay visible by id but leave the
    /// active pool.
    pub fn mark_consolidated(&self, ids: &[String]) -> Result<(), MnemoError> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let now = now_ms();
        let mut args: Vec<&dyn rusqlite::ToSql> = vec![&now];
        for id in ids {
            args.push(id);
        }
        self.conn()?.execute(
            &format!(
                "UPDATE memories SET status = 'consolidated', updated_at = ?1 \
                 WHERE id IN ({placeholders})"
            ),
            args.as_slice(),
        )?;
        Ok(())
    }

    /// Decay rule: soft-delete conversations untouched for more than `days`
    /// days whose access count stayed below `max_access_count`.
    pub fn clean_expired_conversations(
        &self,
        days: i64,
        max_access_count: i64,
    ) -> Result<usize, MnemoError> {
        let now = now_ms();
        let cutoff = now - days * 86_400_000;
        let n = self.conn()?.execute(
            "UPDATE memories SET deleted_at = ?1, updated_at = ?1 \
             WHERE kind = 'conversation' AND status = 'active' AND deleted_at IS NULL \
               AND last_accessed_at < ?2 AND access_count < ?3",
            params![now, cutoff, max_access_count],
        )?;
        Ok(n)
    }

    /// Budget enforcement: while the visible count exceeds `max`, soft-delete
    /// the lowest-priority records — never facts or preferences — ordered by
    /// (access_count ASC, created_at ASC).
    pub fn enforce_budget(&self, max: usize) -> Result<usize, MnemoError> {
        if max == 0 {
            return Ok(0);
        }
        let count = self.count()?;
        if count <= max as i64 {
            return Ok(0);
        }
        let to_delete = count - max as i64;
        let now = now_ms();
        let n = self.conn()?.execute(
            "UPDATE memories SET deleted_at = ?1, updated_at = ?1 \
             WHERE id IN ( \
                SELECT id FROM memories \
                WHERE deleted_at IS NULL AND kind != 'fact' AND kind != 'preference' \
                ORDER BY access_count ASC, created_at ASC \
                LIMIT ?2 \
             )",
            params![now, to_delete],
        )?;
        Ok(n)
    }

    // ------------------------------------------------------------------
    // Embedding cache
    // ------------------------------------------------------------------

    /// Read a cached vector and the provider that produced it.
    pub fn cache_get(&self, hash: &str) -> Result<Option<(Vec<f32>, String)>, MnemoError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT vector, provider FROM embedding_cache WHERE hash = ?1")?;
        let mut rows = stmt.query(params![hash])?;
        match rows.next()? {
            Some(row) => {
                let blob: Vec<u8> = row.get(0)?;
                let provider: String = row.get(1)?;
                Ok(Some((bytes_to_vector(&blob), provider)))
            }
            None => Ok(None),
        }
    }

    /// Write-through upsert; vector and provider are replaced atomically,
    /// last write wins.
    pub fn cache_put(&self, hash: &str, vector: &[f32], provider: &str) -> Result<(), MnemoError> {
        self.conn()?.execute(
            "INSERT INTO embedding_cache (hash, vector, provider, created_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(hash) DO UPDATE SET \
                vector = excluded.vector, provider = excluded.provider, \
                created_at = excluded.created_at",
            params![hash, vector_to_bytes(vector), provider, now_ms()],
        )?;
        Ok(())
    }

    /// Most recent cache entries, used to warm the in-memory layer at startup.
    pub fn cache_load_recent(
        &self,
        limit: usize,
    ) -> Result<Vec<(String, Vec<f32>, String)>, MnemoError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT hash, vector, provider FROM embedding_cache \
             ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let hash: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                let provider: String = row.get(2)?;
                Ok((hash, bytes_to_vector(&blob), provider))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Dream maintenance log
    // ------------------------------------------------------------------

    pub fn log_dream_start(&self, input_count: usize) -> Result<i64, MnemoError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO dream_log (started_at, input_count, status) VALUES (?1, ?2, 'running')",
            params![now_ms(), input_count as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn log_dream_finish(
        &self,
        log_id: i64,
        output_count: usize,
        error_msg: &str,
    ) -> Result<(), MnemoError> {
        let status = if error_msg.is_empty() { "success" } else { "completed with errors" };
        self.conn()?.execute(
            "UPDATE dream_log SET finished_at = ?1, output_count = ?2, status = ?3, \
             error_msg = ?4 WHERE id = ?5",
            params![now_ms(), output_count as i64, status, error_msg, log_id],
        )?;
        Ok(())
    }

    pub fn dream_log_recent(&self, limit: usize) -> Result<Vec<DreamLogEntry>, MnemoError> {
        let limit = if limit == 0 { 20 } else { limit };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, started_at, finished_at, input_count, output_count, status, error_msg \
             FROM dream_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(DreamLogEntry {
                    id: row.get(0)?,
                    started_at: row.get(1)?,
                    finished_at: row.get(2)?,
                    input_count: row.get(3)?,
                    output_count: row.get(4)?,
                    status: row.get(5)?,
                    error_msg: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
