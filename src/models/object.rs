//! Represents an object (file) written to the storage sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Key under which a payload was written to the sink.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ObjectLocator(pub String);

impl ObjectLocator {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata row for a stored payload.
///
/// The row describes the object; the bytes themselves live on disk beneath
/// the sink's storage directory.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectRecord {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Storage key (path-like, e.g. `large-files/1718000000000-abc.pdf`).
    pub key: String,

    /// Last path segment of the key.
    pub filename: String,

    /// Content type (MIME type) recorded at write time.
    pub content_type: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 of the payload, lowercase hex.
    pub etag: String,

    /// When the object was written.
    pub created_at: DateTime<Utc>,
}

/// Result of a successful reassembly or direct upload.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub locator: ObjectLocator,
    pub public_url: String,
    pub byte_size: u64,
    pub content_type: String,
    pub etag: String,
}
