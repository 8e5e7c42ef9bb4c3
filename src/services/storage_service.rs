//! src/services/storage_service.rs
//!
//! Storage sink used by the chunk accumulator and the direct upload path.
//! `LocalDiskSink` keeps payloads on local disk sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}` and records metadata in SQLite.
//! Keys are write-once: a second `put` for an existing key fails instead of
//! overwriting.

use crate::models::object::{ObjectLocator, ObjectRecord};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info};
use uuid::Uuid;

/// Namespace for objects produced by chunked and direct uploads.
pub const LARGE_FILES_PREFIX: &str = "large-files";

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MAX_EXTENSION_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("object `{0}` already exists")]
    AlreadyExists(String),
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("object is {size} bytes, above the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Destination for reassembled payloads.
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Largest payload `put` accepts.
    fn max_object_size(&self) -> u64;

    /// Write `bytes` under `key`. Must fail rather than overwrite an
    /// existing key, and must reject payloads above `max_object_size`.
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str)
    -> StorageResult<ObjectLocator>;

    /// Externally resolvable URL for a written object.
    async fn public_url(&self, locator: &ObjectLocator) -> StorageResult<String>;
}

/// Build a collision-resistant key: `{prefix}/{unix_millis}-{random}.{ext}`.
///
/// Only the extension of `file_name` survives (lower-cased, alphanumeric);
/// the rest of the client-supplied name never reaches the filesystem.
pub fn derive_object_key(prefix: &str, file_name: &str) -> String {
    let stamp = Utc::now().timestamp_millis();
    let random = Uuid::new_v4().simple().to_string();
    let random = &random[..13];
    match file_extension(file_name) {
        Some(ext) => format!("{prefix}/{stamp}-{random}.{ext}"),
        None => format!("{prefix}/{stamp}-{random}"),
    }
}

fn file_extension(file_name: &str) -> Option<String> {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let (_, ext) = base.rsplit_once('.')?;
    let ext: String = ext
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(MAX_EXTENSION_LEN)
        .collect::<String>()
        .to_ascii_lowercase();
    (!ext.is_empty()).then_some(ext)
}

/// Local-disk sink with SQLite metadata.
#[derive(Clone)]
pub struct LocalDiskSink {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    bucket: String,
    public_base_url: String,
    max_object_size: u64,
}

impl LocalDiskSink {
    pub fn new(
        db: Arc<SqlitePool>,
        base_path: impl Into<PathBuf>,
        bucket: impl Into<String>,
        public_base_url: impl Into<String>,
        max_object_size: u64,
    ) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            bucket: bucket.into(),
            public_base_url: public_base_url.into(),
            max_object_size,
        }
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects keys that begin with `/` or contain `..`.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    fn bucket_root(&self) -> PathBuf {
        self.base_path.join(&self.bucket)
    }

    /// Two-level shard identifiers: the first two bytes of MD5(bucket/key)
    /// as lowercase hex.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// base_path/bucket/{shard}/{shard}/{key}. Parent directories may not
    /// exist yet.
    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(&self.bucket, key);
        let mut path = self.bucket_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn fetch_object(&self, key: &str) -> StorageResult<ObjectRecord> {
        sqlx::query_as::<_, ObjectRecord>(
            "SELECT id, key, filename, content_type, size_bytes, etag, created_at
             FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound(key.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Metadata plus an open file handle ready for streaming out.
    pub async fn get_object_reader(&self, key: &str) -> StorageResult<(ObjectRecord, File)> {
        self.ensure_key_safe(key)?;
        let object = self.fetch_object(key).await?;

        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound(key.to_string())
            } else {
                StorageError::Io(err)
            }
        })?;

        Ok((object, file))
    }

    pub async fn get_object_metadata(&self, key: &str) -> StorageResult<ObjectRecord> {
        self.ensure_key_safe(key)?;
        self.fetch_object(key).await
    }

    /// Write `bytes` to a temp file next to `final_path`, fsync it, then
    /// hard-link it into place. The link fails if `final_path` exists.
    async fn write_once(&self, key: &str, final_path: &Path, bytes: &[u8]) -> StorageResult<()> {
        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        if let Err(err) = write_synced(&tmp_path, bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        let linked = fs::hard_link(&tmp_path, final_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        match linked {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(StorageError::AlreadyExists(key.to_string()))
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }
}

#[async_trait]
impl StorageSink for LocalDiskSink {
    fn max_object_size(&self) -> u64 {
        self.max_object_size
    }

    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> StorageResult<ObjectLocator> {
        self.ensure_key_safe(key)?;
        let size = bytes.len() as u64;
        if size > self.max_object_size {
            return Err(StorageError::TooLarge {
                size,
                limit: self.max_object_size,
            });
        }

        let file_path = self.object_path(key);
        self.write_once(key, &file_path, &bytes).await?;

        let etag = format!("{:x}", md5::compute(&bytes));
        let filename = key.split('/').last().unwrap_or(key).to_string();

        let inserted = sqlx::query(
            "INSERT INTO objects (id, key, filename, content_type, size_bytes, etag, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(key)
        .bind(&filename)
        .bind(content_type)
        .bind(size as i64)
        .bind(&etag)
        .bind(Utc::now())
        .execute(&*self.db)
        .await;

        if let Err(err) = inserted {
            let _ = fs::remove_file(&file_path).await;
            return Err(if is_unique_violation(&err) {
                StorageError::AlreadyExists(key.to_string())
            } else {
                StorageError::Sqlx(err)
            });
        }

        info!("stored {} ({} bytes, {})", key, size, content_type);
        Ok(ObjectLocator(key.to_string()))
    }

    async fn public_url(&self, locator: &ObjectLocator) -> StorageResult<String> {
        Ok(format!(
            "{}/files/{}",
            self.public_base_url.trim_end_matches('/'),
            locator
        ))
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    debug!("wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
