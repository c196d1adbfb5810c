//! Durable translation cache tier backed by SQLite.
//! Writes are queued on a channel and batch-flushed every 300ms by a background
//! task, so callers never wait on disk. Write failures are logged, never raised.
//! Reads and flushes run on the blocking pool, off the async workers.
//! Rows older than the cache max age are ignored on read and deleted on sweep.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::cache::CacheKey;

#[derive(Debug, Error)]
#[error("durable cache: {0}")]
pub struct DurableError(#[from] rusqlite::Error);

/// One pending write to the durable tier.
#[derive(Debug, Clone)]
pub struct DurableWrite {
    pub key: CacheKey,
    pub translated_text: String,
    pub src_lang: String,
    pub tgt_lang: String,
    pub confidence: f64,
}

/// A row served by the durable tier, with how long ago it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct DurableHit {
    pub translated_text: String,
    pub confidence: f64,
    pub age: Duration,
}

pub struct DurableCache {
    conn: Arc<Mutex<Connection>>,
    tx: mpsc::UnboundedSender<DurableWrite>,
}

impl DurableCache {
    /// Open (or create) the cache database and start its batch writer.
    /// Must be called from within a Tokio runtime.
    pub fn open(db_path: &Path) -> Result<Arc<Self>, DurableError> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let cache = Self::with_connection(conn)?;
        info!(path = %db_path.display(), "durable translation cache opened");
        Ok(cache)
    }

    pub fn open_in_memory() -> Result<Arc<Self>, DurableError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Arc<Self>, DurableError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS translation_cache (
                cache_key BLOB PRIMARY KEY,
                translated_text TEXT NOT NULL,
                src_lang TEXT NOT NULL,
                tgt_lang TEXT NOT NULL,
                confidence REAL NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_translation_cache_created
                ON translation_cache(created_at);",
        )?;

        let conn = Arc::new(Mutex::new(conn));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(flush_loop(rx, Arc::clone(&conn)));

        Ok(Arc::new(Self { conn, tx }))
    }

    /// Queue a write. Never blocks and never fails from the caller's view.
    pub fn enqueue(&self, write: DurableWrite) {
        if let Err(e) = self.tx.send(write) {
            warn!(error = %e, "durable cache writer gone, dropping write");
        }
    }

    /// Look up a row younger than `max_age`. The query runs on the blocking
    /// pool.
    pub async fn get(&self, key: &CacheKey, max_age: Duration) -> Option<DurableHit> {
        let conn = Arc::clone(&self.conn);
        let key = *key;
        match tokio::task::spawn_blocking(move || read_row(&conn.lock(), &key, max_age)).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(error = %e, "durable cache read task failed");
                None
            }
        }
    }

    /// Write a batch inside one transaction.
    pub fn write_batch(&self, writes: &[DurableWrite]) {
        let conn = self.conn.lock();
        flush_batch(&conn, writes, now_unix());
    }

    /// Write rows that are already `age` old.
    #[cfg(test)]
    pub(crate) fn write_batch_aged(&self, writes: &[DurableWrite], age: Duration) {
        let conn = self.conn.lock();
        flush_batch(&conn, writes, now_unix() - age.as_secs() as i64);
    }

    /// Delete rows older than `max_age`. Returns the number removed.
    pub fn cleanup_expired(&self, max_age: Duration) -> usize {
        let conn = self.conn.lock();
        let cutoff = now_unix() - max_age.as_secs() as i64;
        match conn.execute(
            "DELETE FROM translation_cache WHERE created_at <= ?1",
            params![cutoff],
        ) {
            Ok(count) => {
                if count > 0 {
                    info!(removed = count, "durable cache cleanup");
                }
                count
            }
            Err(e) => {
                warn!(error = %e, "durable cache cleanup failed");
                0
            }
        }
    }
}

async fn flush_loop(mut rx: mpsc::UnboundedReceiver<DurableWrite>, conn: Arc<Mutex<Connection>>) {
    let flush_interval = Duration::from_millis(300);
    let mut buffer: Vec<DurableWrite> = Vec::with_capacity(32);

    loop {
        let closed = tokio::select! {
            _ = tokio::time::sleep(flush_interval) => false,
            msg = rx.recv() => match msg {
                Some(write) => {
                    buffer.push(write);
                    false
                }
                None => true,
            },
        };

        while let Ok(write) = rx.try_recv() {
            buffer.push(write);
        }

        if !buffer.is_empty() {
            let batch = std::mem::take(&mut buffer);
            let conn = Arc::clone(&conn);
            let flushed =
                tokio::task::spawn_blocking(move || flush_batch(&conn.lock(), &batch, now_unix()));
            if let Err(e) = flushed.await {
                warn!(error = %e, "durable cache flush task failed");
            }
        }

        if closed {
            debug!("durable cache writer exiting");
            return;
        }
    }
}

fn read_row(conn: &Connection, key: &CacheKey, max_age: Duration) -> Option<DurableHit> {
    let now = now_unix();
    let cutoff = now - max_age.as_secs() as i64;
    let row = conn
        .query_row(
            "SELECT translated_text, confidence, created_at FROM translation_cache
             WHERE cache_key = ?1 AND created_at > ?2",
            params![key.as_slice(), cutoff],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional();
    match row {
        Ok(found) => found.map(|(translated_text, confidence, created_at)| DurableHit {
            translated_text,
            confidence,
            age: Duration::from_secs(now.saturating_sub(created_at).max(0) as u64),
        }),
        Err(e) => {
            warn!(error = %e, "durable cache read failed");
            None
        }
    }
}

fn flush_batch(conn: &Connection, writes: &[DurableWrite], created_at: i64) {
    if let Err(e) = conn.execute_batch("BEGIN TRANSACTION") {
        warn!(error = %e, "durable cache batch begin failed");
        return;
    }

    let mut stmt = match conn.prepare_cached(
        "INSERT OR REPLACE INTO translation_cache
         (cache_key, translated_text, src_lang, tgt_lang, confidence, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    ) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "durable cache batch prepare failed");
            let _ = conn.execute_batch("ROLLBACK");
            return;
        }
    };

    for w in writes {
        if let Err(e) = stmt.execute(params![
            w.key.as_slice(),
            w.translated_text,
            w.src_lang,
            w.tgt_lang,
            w.confidence,
            created_at,
        ]) {
            warn!(error = %e, "durable cache insert failed");
        }
    }
    drop(stmt);

    if let Err(e) = conn.execute_batch("COMMIT") {
        warn!(error = %e, "durable cache batch commit failed");
    } else {
        debug!(count = writes.len(), "durable cache batch flushed");
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
