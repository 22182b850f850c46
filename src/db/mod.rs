//! SQLite-backed metadata store: memory records, the persistent embedding
//! cache, and the Dream maintenance log.

mod memory;
mod queue;

use std::collections::HashMap;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::error::MnemoError;

pub(crate) use queue::WriteOp;

/// Set busy_timeout on every connection handed out by the pool.
/// Prevents SQLITE_BUSY under concurrent read pressure while the single
/// writer holds the file.
#[derive(Debug)]
struct BusyTimeoutCustomizer;
impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for BusyTimeoutCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    }
}

type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

/// Semantic role of a memory. Recall tiers and eviction branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Conversation,
    Fact,
    Preference,
    Summary,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Conversation => "conversation",
            Kind::Fact => "fact",
            Kind::Preference => "preference",
            Kind::Summary => "summary",
        }
    }

    /// `fact` and `preference` survive budget eviction.
    pub fn protected(self) -> bool {
        matches!(self, Kind::Fact | Kind::Preference)
    }
}

impl std::str::FromStr for Kind {
    type Err = MnemoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversation" => Ok(Kind::Conversation),
            "fact" => Ok(Kind::Fact),
            "preference" => Ok(Kind::Preference),
            "summary" => Ok(Kind::Summary),
            other => Err(MnemoError::Validation(format!("unknown kind '{other}'"))),
        }
    }
}

/// Lifecycle tag. `Consolidated` records were subsumed by a Dream output but
/// remain queryable by id; `Dream` marks records Dream itself produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
    Consolidated,
    Dream,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Consolidated => "consolidated",
            Status::Dream => "dream",
        }
    }
}

impl std::str::FromStr for Status {
    type Err = MnemoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Status::Active),
            "consolidated" => Ok(Status::Consolidated),
            "dream" => Ok(Status::Dream),
            other => Err(MnemoError::Validation(format!("unknown status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub embed_provider: String,
    pub kind: Kind,
    pub access_count: i64,
    pub last_accessed_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
}

impl Memory {
    /// The text whose vector should be stored: the summary when one exists,
    /// otherwise the raw content.
    pub fn embedding_text(&self) -> &str {
        if self.summary.is_empty() {
            &self.content
        } else {
            &self.summary
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub total_active: i64,
    pub total_deleted: i64,
    pub kind_counts: HashMap<String, i64>,
}

/// One row of the Dream maintenance log.
#[derive(Debug, Clone, Serialize)]
pub struct DreamLogEntry {
    pub id: i64,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub input_count: i64,
    pub output_count: i64,
    pub status: String,
    pub error_msg: String,
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    session_id TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL,
    summary TEXT NOT NULL DEFAULT '',
    source TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'active',
    embed_provider TEXT NOT NULL DEFAULT '',
    kind TEXT NOT NULL DEFAULT 'conversation',
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_memories_user ON memories(user_id);
CREATE INDEX IF NOT EXISTS idx_memories_session ON memories(user_id, session_id);
CREATE INDEX IF NOT EXISTS idx_memories_status ON memories(status);
CREATE INDEX IF NOT EXISTS idx_memories_kind ON memories(kind);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);

CREATE TABLE IF NOT EXISTS embedding_cache (
    hash TEXT PRIMARY KEY,
    vector BLOB NOT NULL,
    provider TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS dream_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    input_count INTEGER NOT NULL DEFAULT 0,
    output_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'running',
    error_msg TEXT NOT NULL DEFAULT ''
);
"#;

/// SQLite-backed metadata store. High-frequency writes (`insert`,
/// `bump_access`) are absorbed by a bounded queue drained by a single
/// coalescing writer thread; everything else talks to the pool directly.
pub struct MetaStore {
    pool: Pool<SqliteConnectionManager>,
    queue: queue::WriteQueue,
}

impl MetaStore {
    /// Open (or create) a store at the given path.
    /// Pool size defaults to 8 (1 writer + 7 readers in WAL mode).
    pub fn open(path: &str) -> Result<Self, MnemoError> {
        if path != ":memory:" {
            if let Some(dir) = std::path::Path::new(path).parent() {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir)
                        .map_err(|e| MnemoError::Internal(format!("create db dir: {e}")))?;
                }
            }
        }

        let pool_size = if path == ":memory:" { 2 } else { 8 };
        let manager = if path == ":memory:" {
            // Shared cache so all pool connections see the same in-memory DB.
            // Each open gets a unique name to avoid cross-test pollution.
            let name = uuid::Uuid::new_v4().to_string();
            SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            SqliteConnectionManager::file(path)
        };
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_customizer(Box::new(BusyTimeoutCustomizer))
            .build(manager)
            .map_err(|e| MnemoError::Internal(format!("pool: {e}")))?;

        let conn = pool.get().map_err(|e| MnemoError::Internal(e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);

        let queue = queue::WriteQueue::start(pool.clone());
        Ok(Self { pool, queue })
    }

    pub(crate) fn conn(&self) -> Result<PooledConn, MnemoError> {
        self.pool.get().map_err(|e| MnemoError::Internal(format!("pool: {e}")))
    }

    /// Enqueue a write, or run it synchronously when the queue is full or
    /// already shut down.
    pub(crate) fn enqueue(&self, op: WriteOp) -> Result<(), MnemoError> {
        if let Some(op) = self.queue.push(op) {
            let conn = self.conn()?;
            queue::apply(&conn, &op)?;
        }
        Ok(())
    }

    /// Wait until every write enqueued before this call has been committed.
    pub fn flush(&self) {
        self.queue.flush();
    }

    /// Flush the remaining queue and stop the writer. Further high-frequency
    /// writes degrade to synchronous execution.
    pub fn close(&self) {
        self.queue.close();
    }
}

impl Drop for MetaStore {
    fn drop(&mut self) {
        self.queue.close();
    }
}

fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
    let tags_str: String = row.get("tags")?;
    let status: String = row.get("status")?;
    let kind: String = row.get("kind")?;
    Ok(Memory {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        session_id: row.get("session_id")?,
        content: row.get("content")?,
        summary: row.get("summary")?,
        source: row.get("source")?,
        tags: serde_json::from_str(&tags_str).unwrap_or_default(),
        status: status.parse().unwrap_or(Status::Active),
        embed_provider: row.get("embed_provider")?,
        kind: kind.parse().unwrap_or(Kind::Conversation),
        access_count: row.get("access_count")?,
        last_accessed_at: row.get("last_accessed_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        deleted_at: row.get("deleted_at")?,
    })
}
