//! Keyed storage for in-flight upload sessions.
//!
//! The accumulator talks to `SessionStore` only, so the in-memory map can be
//! swapped for the SQLite-backed store (which survives restarts) without
//! touching reassembly logic.

use crate::models::session::UploadSession;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("upload `{upload_id}` has {expected} chunks, but this chunk declares {declared}")]
    TotalMismatch {
        upload_id: String,
        expected: u32,
        declared: u32,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// One chunk to record, with the session attributes it declares.
#[derive(Clone, Debug)]
pub struct ChunkWrite<'a> {
    pub upload_id: &'a str,
    pub file_name: &'a str,
    pub content_type: Option<&'a str>,
    pub total_chunks: u32,
    pub chunk_index: u32,
    pub data: Bytes,
}

/// Session totals after a chunk was recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkReceipt {
    pub received: usize,
    pub bytes_received: u64,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Record a chunk, creating the session on first use. A duplicate
    /// ordinal replaces the earlier payload. Fails without mutating anything
    /// when the session exists with a different chunk count.
    async fn put_chunk(&self, write: ChunkWrite<'_>) -> Result<ChunkReceipt, SessionStoreError>;

    async fn get(&self, upload_id: &str) -> Result<Option<UploadSession>, SessionStoreError>;

    async fn delete(&self, upload_id: &str) -> Result<(), SessionStoreError>;

    /// Drop every session whose last chunk arrived more than `ttl` ago.
    /// Returns how many sessions were evicted.
    async fn sweep_idle(&self, ttl: Duration) -> Result<usize, SessionStoreError>;

    /// Number of sessions currently held.
    async fn len(&self) -> Result<usize, SessionStoreError>;
}

fn idle_cutoff(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
    Utc::now()
        .checked_sub_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local sessions behind a `RwLock`. Lost on restart.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, UploadSession>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn put_chunk(&self, write: ChunkWrite<'_>) -> Result<ChunkReceipt, SessionStoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(write.upload_id.to_string())
            .or_insert_with(|| {
                UploadSession::new(
                    write.upload_id,
                    write.file_name,
                    write.content_type.map(str::to_string),
                    write.total_chunks,
                )
            });

        if session.total_chunks != write.total_chunks {
            return Err(SessionStoreError::TotalMismatch {
                upload_id: write.upload_id.to_string(),
                expected: session.total_chunks,
                declared: write.total_chunks,
            });
        }

        session.insert(write.chunk_index, write.data);
        Ok(ChunkReceipt {
            received: session.received(),
            bytes_received: session.bytes_received,
        })
    }

    async fn get(&self, upload_id: &str) -> Result<Option<UploadSession>, SessionStoreError> {
        Ok(self.sessions.read().await.get(upload_id).cloned())
    }

    async fn delete(&self, upload_id: &str) -> Result<(), SessionStoreError> {
        self.sessions.write().await.remove(upload_id);
        Ok(())
    }

    async fn sweep_idle(&self, ttl: Duration) -> Result<usize, SessionStoreError> {
        let cutoff = idle_cutoff(ttl);
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.updated_at >= cutoff);
        Ok(before - sessions.len())
    }

    async fn len(&self) -> Result<usize, SessionStoreError> {
        Ok(self.sessions.read().await.len())
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

/// Sessions persisted in the `upload_chunks` table, one row per chunk.
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Arc<SqlitePool>,
}

impl SqliteSessionStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn put_chunk(&self, write: ChunkWrite<'_>) -> Result<ChunkReceipt, SessionStoreError> {
        // Take the write lock up front; a deferred transaction that upgrades
        // after its SELECT fails with SQLITE_BUSY instead of waiting.
        let mut tx = self.db.begin_with("BEGIN IMMEDIATE").await?;

        let existing: Option<(i64, i64)> = sqlx::query_as(
            "SELECT total_chunks, created_at FROM upload_chunks WHERE upload_id = ? LIMIT 1",
        )
        .bind(write.upload_id)
        .fetch_optional(&mut *tx)
        .await?;

        let now = Utc::now().timestamp_millis();
        let created_at = match existing {
            Some((total, _)) if total != i64::from(write.total_chunks) => {
                return Err(SessionStoreError::TotalMismatch {
                    upload_id: write.upload_id.to_string(),
                    expected: total as u32,
                    declared: write.total_chunks,
                });
            }
            Some((_, created_at)) => created_at,
            None => now,
        };

        sqlx::query(
            "INSERT INTO upload_chunks
                (upload_id, chunk_index, total_chunks, file_name, content_type, data, created_at, received_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(upload_id, chunk_index) DO UPDATE SET
                data = excluded.data,
                received_at = excluded.received_at",
        )
        .bind(write.upload_id)
        .bind(i64::from(write.chunk_index))
        .bind(i64::from(write.total_chunks))
        .bind(write.file_name)
        .bind(write.content_type)
        .bind(write.data.as_ref())
        .bind(created_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let (received, bytes_received): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(LENGTH(data)), 0) FROM upload_chunks WHERE upload_id = ?",
        )
        .bind(write.upload_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ChunkReceipt {
            received: received as usize,
            bytes_received: bytes_received as u64,
        })
    }

    async fn get(&self, upload_id: &str) -> Result<Option<UploadSession>, SessionStoreError> {
        let rows = sqlx::query(
            "SELECT chunk_index, total_chunks, file_name, content_type, data, created_at, received_at
             FROM upload_chunks WHERE upload_id = ? ORDER BY chunk_index",
        )
        .bind(upload_id)
        .fetch_all(&*self.db)
        .await?;

        let Some(first) = rows.first() else {
            return Ok(None);
        };

        let mut session = UploadSession::new(
            upload_id,
            first.try_get::<String, _>("file_name")?,
            first.try_get::<Option<String>, _>("content_type")?,
            first.try_get::<i64, _>("total_chunks")? as u32,
        );
        session.created_at = from_millis(first.try_get("created_at")?);

        let mut last_received = i64::MIN;
        for row in &rows {
            let index = row.try_get::<i64, _>("chunk_index")? as u32;
            let data: Vec<u8> = row.try_get("data")?;
            session.insert(index, Bytes::from(data));
            last_received = last_received.max(row.try_get("received_at")?);
        }
        session.updated_at = from_millis(last_received);

        Ok(Some(session))
    }

    async fn delete(&self, upload_id: &str) -> Result<(), SessionStoreError> {
        sqlx::query("DELETE FROM upload_chunks WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn sweep_idle(&self, ttl: Duration) -> Result<usize, SessionStoreError> {
        let cutoff = idle_cutoff(ttl).timestamp_millis();
        let mut tx = self.db.begin_with("BEGIN IMMEDIATE").await?;

        let stale: Vec<(String,)> = sqlx::query_as(
            "SELECT upload_id FROM upload_chunks GROUP BY upload_id HAVING MAX(received_at) < ?",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        for (upload_id,) in &stale {
            sqlx::query("DELETE FROM upload_chunks WHERE upload_id = ?")
                .bind(upload_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(stale.len())
    }

    async fn len(&self) -> Result<usize, SessionStoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT upload_id) FROM upload_chunks")
            .fetch_one(&*self.db)
            .await?;
        Ok(count as usize)
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Periodically evict sessions abandoned by their clients.
pub fn spawn_session_sweeper(
    store: Arc<dyn SessionStore>,
    ttl: Duration,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.sweep_idle(ttl).await {
                Ok(0) => {}
                Ok(evicted) => info!("evicted {} idle upload session(s)", evicted),
                Err(err) => warn!("session sweep failed: {}", err),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn write<'a>(upload_id: &'a str, index: u32, total: u32, data: &'static [u8]) -> ChunkWrite<'a> {
        ChunkWrite {
            upload_id,
            file_name: "ata.pdf",
            content_type: Some("application/pdf"),
            total_chunks: total,
            chunk_index: index,
            data: Bytes::from_static(data),
        }
    }

    async fn sqlite_store() -> SqliteSessionStore {
        let pool = db::memory_pool().await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        SqliteSessionStore::new(Arc::new(pool))
    }

    async fn exercise_put_get_delete(store: &dyn SessionStore) {
        let r = store.put_chunk(write("a", 1, 2, b"world")).await.unwrap();
        assert_eq!(r, ChunkReceipt { received: 1, bytes_received: 5 });
        let r = store.put_chunk(write("a", 0, 2, b"hello ")).await.unwrap();
        assert_eq!(r, ChunkReceipt { received: 2, bytes_received: 11 });

        let session = store.get("a").await.unwrap().unwrap();
        assert_eq!(session.file_name, "ata.pdf");
        assert_eq!(session.content_type.as_deref(), Some("application/pdf"));
        assert_eq!(session.total_chunks, 2);
        assert_eq!(session.reassemble().unwrap(), Bytes::from_static(b"hello world"));

        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        assert_eq!(store.len().await.unwrap(), 0);
    }

    async fn exercise_total_mismatch(store: &dyn SessionStore) {
        store.put_chunk(write("m", 0, 3, b"abc")).await.unwrap();
        let err = store.put_chunk(write("m", 1, 4, b"def")).await.unwrap_err();
        assert!(matches!(
            err,
            SessionStoreError::TotalMismatch { expected: 3, declared: 4, .. }
        ));
        let session = store.get("m").await.unwrap().unwrap();
        assert_eq!(session.received(), 1);
    }

    async fn exercise_isolation_and_sweep(store: &dyn SessionStore) {
        store.put_chunk(write("x", 0, 2, b"1")).await.unwrap();
        store.put_chunk(write("y", 0, 2, b"2")).await.unwrap();
        store.delete("x").await.unwrap();
        assert!(store.get("y").await.unwrap().is_some());

        assert_eq!(store.sweep_idle(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.sweep_idle(Duration::from_millis(5)).await.unwrap(), 1);
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn memory_store_put_get_delete() {
        exercise_put_get_delete(&InMemorySessionStore::new()).await;
    }

    #[tokio::test]
    async fn memory_store_rejects_total_mismatch() {
        exercise_total_mismatch(&InMemorySessionStore::new()).await;
    }

    #[tokio::test]
    async fn memory_store_isolation_and_sweep() {
        exercise_isolation_and_sweep(&InMemorySessionStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_put_get_delete() {
        exercise_put_get_delete(&sqlite_store().await).await;
    }

    #[tokio::test]
    async fn sqlite_store_rejects_total_mismatch() {
        exercise_total_mismatch(&sqlite_store().await).await;
    }

    #[tokio::test]
    async fn sqlite_store_isolation_and_sweep() {
        exercise_isolation_and_sweep(&sqlite_store().await).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sqlite_store_accepts_parallel_uploads_on_a_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("sessions.db").display());
        let pool = db::connect(&url, 5).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let store = Arc::new(SqliteSessionStore::new(Arc::new(pool)));

        let tasks: Vec<_> = (0..16)
            .map(|upload| {
                let store = store.clone();
                tokio::spawn(async move {
                    let upload_id = format!("upload-{upload}");
                    for index in 0..20u32 {
                        store
                            .put_chunk(ChunkWrite {
                                upload_id: &upload_id,
                                file_name: "video.mp4",
                                content_type: None,
                                total_chunks: 20,
                                chunk_index: index,
                                data: Bytes::from(vec![upload as u8; 64 * 1024]),
                            })
                            .await?;
                    }
                    Ok::<_, SessionStoreError>(())
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.len().await.unwrap(), 16);
        for upload in 0..16u8 {
            let session = store.get(&format!("upload-{upload}")).await.unwrap().unwrap();
            assert_eq!(session.received(), 20);
            assert_eq!(session.bytes_received, 20 * 64 * 1024);
            assert!(session.reassemble().unwrap().iter().all(|b| *b == upload));
        }
    }

    #[tokio::test]
    async fn sqlite_store_duplicate_chunk_replaces_payload() {
        let store = sqlite_store().await;
        store.put_chunk(write("d", 0, 2, b"long payload")).await.unwrap();
        let r = store.put_chunk(write("d", 0, 2, b"short")).await.unwrap();
        assert_eq!(r, ChunkReceipt { received: 1, bytes_received: 5 });
    }
}
