//! Bounded write queue for high-frequency metadata writes.
//!
//! `insert` and `bump_access` are enqueued and drained by a single writer
//! thread that coalesces operations into transactions of up to
//! [`MAX_BATCH`] ops, flushed every [`WINDOW_MS`] ms or at the batch cap,
//! whichever comes first. On overflow the caller falls back to a synchronous
//! write, so no operation is ever dropped.

use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::time::{Duration, Instant};

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tracing::{debug, warn};

use super::{now_ms, Memory};

const QUEUE_CAP: usize = 5000;
const MAX_BATCH: usize = 100;
const WINDOW_MS: u64 = 50;

pub(crate) enum WriteOp {
    Insert(Box<Memory>),
    BumpAccess(String),
    /// Commit everything received so far, then ack.
    Flush(SyncSender<()>),
}

pub(crate) struct WriteQueue {
    tx: parking_lot::Mutex<Option<SyncSender<WriteOp>>>,
    worker: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl WriteQueue {
    pub(crate) fn start(pool: Pool<SqliteConnectionManager>) -> Self {
        let (tx, rx) = mpsc::sync_channel::<WriteOp>(QUEUE_CAP);
        let worker = std::thread::Builder::new()
            .name("mnemo-writer".into())
            .spawn(move || writer_loop(rx, pool))
            .expect("failed to spawn writer thread");
        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            worker: parking_lot::Mutex::new(Some(worker)),
        }
    }

    /// Try to enqueue. Returns the op back when the queue is full or closed
    /// so the caller can execute it synchronously.
    pub(crate) fn push(&self, op: WriteOp) -> Option<WriteOp> {
        let guard = self.tx.lock();
        match guard.as_ref() {
            None => Some(op),
            Some(tx) => match tx.try_send(op) {
                Ok(()) => None,
                Err(TrySendError::Full(op)) | Err(TrySendError::Disconnected(op)) => Some(op),
            },
        }
    }

    /// Block until every op enqueued before this call is committed.
    pub(crate) fn flush(&self) {
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else { return };
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if tx.send(WriteOp::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Flush the remaining queue and join the writer. Idempotent.
    pub(crate) fn close(&self) {
        self.flush();
        // Dropping the sender disconnects the channel; the writer drains
        // whatever is left and exits.
        self.tx.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn writer_loop(rx: mpsc::Receiver<WriteOp>, pool: Pool<SqliteConnectionManager>) {
    let mut batch: Vec<WriteOp> = Vec::with_capacity(MAX_BATCH);

    loop {
        // Block until the first op arrives (or the store closes).
        match rx.recv() {
            Ok(WriteOp::Flush(ack)) => {
                // Nothing pending — everything before this was already flushed.
                let _ = ack.send(());
                continue;
            }
            Ok(op) => batch.push(op),
            Err(_) => break,
        }

        // The time window starts now: collect until deadline or cap.
        let deadline = Instant::now() + Duration::from_millis(WINDOW_MS);
        let mut acks = Vec::new();
        let mut closed = false;
        while batch.len() < MAX_BATCH {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(WriteOp::Flush(ack)) => {
                    acks.push(ack);
                    break;
                }
                Ok(op) => batch.push(op),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    closed = true;
                    break;
                }
            }
        }

        flush_batch(&pool, &mut batch);
        for ack in acks {
            let _ = ack.send(());
        }
        if closed {
            break;
        }
    }

    // Channel disconnected: commit whatever is left before exiting.
    flush_batch(&pool, &mut batch);
}

fn flush_batch(pool: &Pool<SqliteConnectionManager>, batch: &mut Vec<WriteOp>) {
    if batch.is_empty() {
        return;
    }
    let count = batch.len();
    let mut conn = match pool.get() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, count, "write queue: pool exhausted, dropping to per-op retry");
            return;
        }
    };
    let needs_individual_apply = match conn.transaction() {
        Ok(tx) => {
            for op in batch.iter() {
                if let Err(e) = apply(&tx, op) {
                    warn!(error = %e, "write queue: op failed inside batch");
                }
            }
            if let Err(e) = tx.commit() {
                warn!(error = %e, count, "write queue: batch commit failed");
            }
            false
        }
        Err(e) => {
            // No transaction available — degrade to one-by-one execution.
            warn!(error = %e, count, "write queue: begin failed, applying ops individually");
            true
        }
    };
    if needs_individual_apply {
        for op in batch.iter() {
            if let Err(e) = apply(&conn, op) {
                warn!(error = %e, "write queue: op failed");
            }
        }
    }
    debug!(count, "write queue flushed");
    batch.clear();
}

pub(crate) fn apply(conn: &rusqlite::Connection, op: &WriteOp) -> Result<(), rusqlite::Error> {
    match op {
        WriteOp::Insert(m) => exec_insert(conn, m),
        WriteOp::BumpAccess(id) => exec_bump_access(conn, id),
        WriteOp::Flush(ack) => {
            let _ = ack.send(());
            Ok(())
        }
    }
}

fn exec_insert(conn: &rusqlite::Connection, m: &Memory) -> Result<(), rusqlite::Error> {
    let tags_json = serde_json::to_string(&m.tags).unwrap_or_else(|_| "[]".into());
    conn.execute(
        "INSERT INTO memories \
         (id, user_id, session_id, content, summary, source, tags, status, \
          embed_provider, kind, access_count, last_accessed_at, created_at, updated_at) \
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
        params![
            m.id,
            m.user_id,
            m.session_id,
            m.content,
            m.summary,
            m.source,
            tags_json,
            m.status.as_str(),
            m.embed_provider,
            m.kind.as_str(),
            m.access_count,
            m.last_accessed_at,
            m.created_at,
            m.updated_at,
        ],
    )?;
    Ok(())
}

fn exec_bump_access(conn: &rusqlite::Connection, id: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE memories SET access_count = access_count + 1, last_accessed_at = ?1 WHERE id = ?2",
        params![now_ms(), id],
    )?;
    Ok(())
}
