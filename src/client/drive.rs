//! Google Drive uploads.
//!
//! Files that fit in one chunk go up as a single `multipart/related`
//! request. Larger files use the resumable protocol: a session is opened with
//! the file metadata, then the bytes are PUT in `Content-Range` tagged
//! chunks. Intermediate chunks are answered with `308 Resume Incomplete`,
//! whose `Range: bytes=0-{n}` header is the authoritative count of bytes the
//! remote has persisted; the next chunk always starts there. Once the file
//! exists it is shared publicly with a separate permissions request.

use crate::client::json_or_snippet;
use bytes::{BufMut, Bytes, BytesMut};
use reqwest::{
    StatusCode,
    header::{CONTENT_RANGE, CONTENT_TYPE, HeaderMap, LOCATION},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const DEFAULT_DRIVE_CHUNK_SIZE: usize = 5 * 1024 * 1024;

const RESUME_INCOMPLETE: StatusCode = StatusCode::PERMANENT_REDIRECT;

/// Consecutive 308 replies without forward progress before giving up.
const MAX_STALLED_CHUNKS: u32 = 3;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("Drive credentials are not configured")]
    NotConfigured,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("could not obtain an access token: {0}")]
    Token(String),
    #[error("could not start resumable upload: {0}")]
    Initiate(String),
    #[error("resumable upload response carried no session URI")]
    MissingSessionUri,
    #[error("chunk {chunk}/{total} failed: {message}")]
    Chunk {
        chunk: u64,
        total: u64,
        message: String,
    },
    #[error("chunk {chunk}/{total} could not be sent: {source}")]
    Transport {
        chunk: u64,
        total: u64,
        #[source]
        source: reqwest::Error,
    },
    #[error("upload to Drive failed: {0}")]
    Upload(String),
    #[error("resumable upload made no progress past byte {offset} of {total}")]
    Stalled { offset: u64, total: u64 },
    #[error("upload finished without returning a file id")]
    MissingFileId,
    #[error("file {file_id} was uploaded but could not be made public: {message}")]
    NotPublic { file_id: String, message: String },
    #[error("unexpected response from Drive: {0}")]
    InvalidResponse(String),
}

/// Client-side state of one resumable upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumableSession {
    pub session_uri: String,
    /// Bytes the remote has acknowledged persisting.
    pub bytes_confirmed: u64,
    pub total_size: u64,
}

/// A file created on Drive and shared publicly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveFile {
    pub id: String,
    pub view_url: String,
}

pub fn view_url(file_id: &str) -> String {
    format!("https://drive.google.com/file/d/{file_id}/view")
}

#[derive(Serialize)]
struct FileMetadata<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parents: Option<[&'a str; 1]>,
}

#[derive(Serialize)]
struct Permission {
    role: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct CreatedFile {
    #[serde(default)]
    id: String,
}

pub struct DriveClient {
    http: reqwest::Client,
    access_token: String,
    folder_id: Option<String>,
    upload_base: String,
    api_base: String,
    chunk_size: usize,
}

impl DriveClient {
    pub fn new(
        access_token: impl Into<String>,
        folder_id: Option<String>,
    ) -> Result<Self, DriveError> {
        // A 308 here means "resume incomplete", never a redirect to follow.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            access_token: access_token.into(),
            folder_id: folder_id.filter(|f| !f.is_empty()),
            upload_base: DEFAULT_UPLOAD_BASE.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            chunk_size: DEFAULT_DRIVE_CHUNK_SIZE,
        })
    }

    pub fn with_endpoints(
        mut self,
        upload_base: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Self {
        self.upload_base = upload_base.into().trim_end_matches('/').to_string();
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn metadata<'a>(&'a self, name: &'a str) -> FileMetadata<'a> {
        FileMetadata {
            name,
            parents: self.folder_id.as_deref().map(|f| [f]),
        }
    }

    /// Upload `source` and share it publicly.
    ///
    /// A [`DriveError::NotPublic`] means the file exists but sharing failed;
    /// retry with [`DriveClient::make_public`].
    pub async fn upload<F>(
        &self,
        source: Bytes,
        name: &str,
        content_type: &str,
        on_progress: F,
    ) -> Result<DriveFile, DriveError>
    where
        F: FnMut(f64),
    {
        info!("uploading {} to Drive ({} bytes)", name, source.len());
        let id = if source.len() > self.chunk_size {
            self.upload_resumable(source, name, content_type, on_progress)
                .await?
        } else {
            let mut on_progress = on_progress;
            let id = self.upload_simple(source, name, content_type).await?;
            on_progress(1.0);
            id
        };

        self.make_public(&id).await?;
        let view_url = view_url(&id);
        info!("Drive upload complete: {}", view_url);
        Ok(DriveFile { id, view_url })
    }

    /// Single-request upload for small files.
    pub async fn upload_simple(
        &self,
        source: Bytes,
        name: &str,
        content_type: &str,
    ) -> Result<String, DriveError> {
        let boundary = format!("drive-{}", Uuid::new_v4().simple());
        let metadata = serde_json::to_vec(&self.metadata(name))
            .map_err(|err| DriveError::InvalidResponse(err.to_string()))?;

        let mut body = BytesMut::with_capacity(source.len() + metadata.len() + 256);
        let metadata_head =
            format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n");
        let media_head = format!("\r\n--{boundary}\r\nContent-Type: {content_type}\r\n\r\n");
        body.put_slice(metadata_head.as_bytes());
        body.put_slice(&metadata);
        body.put_slice(media_head.as_bytes());
        body.put_slice(&source);
        body.put_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let resp = self
            .http
            .post(format!("{}/files?uploadType=multipart", self.upload_base))
            .bearer_auth(&self.access_token)
            .header(CONTENT_TYPE, format!("multipart/related; boundary={boundary}"))
            .body(body.freeze())
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(DriveError::Upload(json_or_snippet(status, &text)));
        }
        parse_file_id(&text)
    }

    /// Open a resumable session for `total_size` bytes.
    pub async fn start_session(
        &self,
        name: &str,
        content_type: &str,
        total_size: u64,
    ) -> Result<ResumableSession, DriveError> {
        let resp = self
            .http
            .post(format!("{}/files?uploadType=resumable", self.upload_base))
            .bearer_auth(&self.access_token)
            .header("X-Upload-Content-Type", content_type)
            .header("X-Upload-Content-Length", total_size.to_string())
            .json(&self.metadata(name))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(DriveError::Initiate(json_or_snippet(status, &text)));
        }

        let session_uri = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(DriveError::MissingSessionUri)?
            .to_string();
        debug!("resumable session opened for {}", name);

        Ok(ResumableSession {
            session_uri,
            bytes_confirmed: 0,
            total_size,
        })
    }

    /// Send the bytes of `source` not yet confirmed by the remote, returning
    /// the created file id.
    ///
    /// Progress is `(chunk + 1) / chunks` for the chunk just sent, where the
    /// chunk ordinal is derived from its start offset, and `1.0` once the
    /// remote reports the file complete.
    pub async fn transfer<F>(
        &self,
        session: &mut ResumableSession,
        source: &Bytes,
        mut on_progress: F,
    ) -> Result<String, DriveError>
    where
        F: FnMut(f64),
    {
        let total = session.total_size;
        if session.bytes_confirmed > total {
            return Err(DriveError::InvalidResponse(format!(
                "session claims {} confirmed bytes of {}",
                session.bytes_confirmed, total
            )));
        }
        if source.len() as u64 != total {
            return Err(DriveError::InvalidResponse(format!(
                "source is {} bytes but the session declared {}",
                source.len(),
                total
            )));
        }

        let chunk_size = self.chunk_size as u64;
        let total_chunks = total.div_ceil(chunk_size).max(1);
        let mut offset = session.bytes_confirmed;
        let mut stalled = 0;

        loop {
            let end = (offset + chunk_size).min(total);
            let chunk = offset / chunk_size;
            let content_range = if total == 0 {
                "bytes */0".to_string()
            } else {
                format!("bytes {}-{}/{}", offset, end - 1, total)
            };
            debug!(
                "sending chunk {}/{} ({})",
                chunk + 1,
                total_chunks,
                content_range
            );

            let transport = |err| DriveError::Transport {
                chunk: chunk + 1,
                total: total_chunks,
                source: err,
            };
            let resp = self
                .http
                .put(&session.session_uri)
                .bearer_auth(&self.access_token)
                .header(CONTENT_RANGE, content_range)
                .body(source.slice(offset as usize..end as usize))
                .send()
                .await
                .map_err(transport)?;

            let status = resp.status();
            if status.is_success() {
                let text = resp.text().await.map_err(transport)?;
                session.bytes_confirmed = total;
                on_progress(1.0);
                return parse_file_id(&text);
            }
            on_progress(((chunk + 1) as f64 / total_chunks as f64).min(1.0));
            if status != RESUME_INCOMPLETE {
                let text = resp.text().await.unwrap_or_default();
                return Err(DriveError::Chunk {
                    chunk: chunk + 1,
                    total: total_chunks,
                    message: json_or_snippet(status, &text),
                });
            }

            let next = match parse_range_end(resp.headers()) {
                Some(last) => last + 1,
                None => end,
            };
            if next != end {
                info!(
                    "remote confirmed {} bytes, continuing from there instead of {}",
                    next, end
                );
            }
            session.bytes_confirmed = next;

            if next >= total {
                return Err(DriveError::InvalidResponse(format!(
                    "remote holds all {total} bytes but did not finish the upload"
                )));
            }
            if next <= offset {
                stalled += 1;
                warn!("no progress past byte {} ({} in a row)", offset, stalled);
                if stalled >= MAX_STALLED_CHUNKS {
                    return Err(DriveError::Stalled { offset, total });
                }
            } else {
                stalled = 0;
            }
            offset = next;
        }
    }

    /// Open a session and transfer `source` through it.
    pub async fn upload_resumable<F>(
        &self,
        source: Bytes,
        name: &str,
        content_type: &str,
        on_progress: F,
    ) -> Result<String, DriveError>
    where
        F: FnMut(f64),
    {
        let mut session = self
            .start_session(name, content_type, source.len() as u64)
            .await?;
        self.transfer(&mut session, &source, on_progress).await
    }

    /// Grant read access to anyone with the link.
    pub async fn make_public(&self, file_id: &str) -> Result<(), DriveError> {
        let not_public = |message: String| DriveError::NotPublic {
            file_id: file_id.to_string(),
            message,
        };

        let resp = self
            .http
            .post(format!("{}/files/{}/permissions", self.api_base, file_id))
            .bearer_auth(&self.access_token)
            .json(&Permission {
                role: "reader",
                kind: "anyone",
            })
            .send()
            .await
            .map_err(|err| not_public(err.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(not_public(json_or_snippet(status, &text)));
        }
        Ok(())
    }
}

fn parse_file_id(body: &str) -> Result<String, DriveError> {
    let created: CreatedFile = serde_json::from_str(body)
        .map_err(|err| DriveError::InvalidResponse(format!("file response: {err}")))?;
    if created.id.is_empty() {
        return Err(DriveError::MissingFileId);
    }
    Ok(created.id)
}

/// Last persisted byte from a `Range: bytes=0-{n}` header. The range is
/// inclusive, so the remote holds `n + 1` bytes.
fn parse_range_end(headers: &HeaderMap) -> Option<u64> {
    let range = headers.get("range")?.to_str().ok()?;
    range.trim().strip_prefix("bytes=0-")?.parse::<u64>().ok()
}
