//! Client side of the chunk submit endpoint.
//!
//! A source is sliced into `chunk_size` pieces which are POSTed one at a
//! time; each request is awaited before the next is sent. The server holds
//! all partial state, so an aborted sequence leaves nothing behind locally.

use crate::{
    client::error_field_or_snippet,
    config::UploadPolicy,
    models::chunk::{ChunkReply, fields},
};
use bytes::Bytes;
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CHUNK_UPLOAD_PATH: &str = "/api/chunk-upload";

#[derive(Debug, Error)]
pub enum UploadClientError {
    #[error("source is {size} bytes, above the {limit} byte upload limit")]
    SourceTooLarge { size: u64, limit: u64 },
    #[error("chunk {chunk}/{total} of `{file_name}` was rejected ({status}): {message}")]
    ChunkRejected {
        file_name: String,
        chunk: u32,
        total: u32,
        status: u16,
        message: String,
    },
    #[error("chunk {chunk}/{total} of `{file_name}` could not be sent: {source}")]
    Transport {
        file_name: String,
        chunk: u32,
        total: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("upload of `{0}` finished without returning a file URL")]
    MissingUrl(String),
    #[error(
        "part {part}/{parts} failed after {} completed part(s): {source}",
        .completed.len()
    )]
    PartFailed {
        part: usize,
        parts: usize,
        completed: Vec<RemoteObject>,
        #[source]
        source: Box<UploadClientError>,
    },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// An object the server reported as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub url: String,
    pub file_name: String,
    pub file_size: u64,
}

/// Unique id for one upload sequence: millisecond timestamp plus a random
/// suffix.
pub fn new_upload_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{}{}", Utc::now().timestamp_millis(), &random[..13])
}

/// Drives chunked uploads against one server.
#[derive(Clone)]
pub struct ChunkUploader {
    http: reqwest::Client,
    endpoint: String,
    pub(crate) policy: UploadPolicy,
}

impl ChunkUploader {
    pub fn new(server_base: &str, policy: UploadPolicy) -> Result<Self, UploadClientError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self::with_http_client(http, server_base, policy))
    }

    pub fn with_http_client(
        http: reqwest::Client,
        server_base: &str,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            http,
            endpoint: format!("{}{}", server_base.trim_end_matches('/'), CHUNK_UPLOAD_PATH),
            policy,
        }
    }

    /// Upload `source` as one object, reporting progress in `[0, 1]` after
    /// every chunk. Fails on the first rejected chunk; nothing is retried.
    pub async fn upload_object<F>(
        &self,
        source: Bytes,
        file_name: &str,
        content_type: Option<&str>,
        mut on_progress: F,
    ) -> Result<RemoteObject, UploadClientError>
    where
        F: FnMut(f64),
    {
        let upload_id = new_upload_id();
        let chunk_size = self.policy.chunk_size.max(1);
        let total_chunks = source.len().div_ceil(chunk_size).max(1) as u32;
        info!(
            "starting chunked upload of {} ({} bytes, {} chunks)",
            file_name,
            source.len(),
            total_chunks
        );

        for index in 0..total_chunks {
            let start = index as usize * chunk_size;
            let end = (start + chunk_size).min(source.len());
            let chunk = source.slice(start..end);
            debug!(
                "sending chunk {}/{} ({} bytes)",
                index + 1,
                total_chunks,
                chunk.len()
            );

            let reply = self
                .send_chunk(&upload_id, file_name, content_type, index, total_chunks, chunk)
                .await?;
            on_progress(f64::from(index + 1) / f64::from(total_chunks));

            if reply.is_complete {
                let url = reply
                    .file_url
                    .ok_or_else(|| UploadClientError::MissingUrl(file_name.to_string()))?;
                info!("upload of {} complete: {}", file_name, url);
                return Ok(RemoteObject {
                    url,
                    file_name: reply.file_name.unwrap_or_else(|| file_name.to_string()),
                    file_size: reply.file_size.unwrap_or(source.len() as u64),
                });
            }
        }

        Err(UploadClientError::MissingUrl(file_name.to_string()))
    }

    async fn send_chunk(
        &self,
        upload_id: &str,
        file_name: &str,
        content_type: Option<&str>,
        index: u32,
        total: u32,
        chunk: Bytes,
    ) -> Result<ChunkReply, UploadClientError> {
        let transport = |source| UploadClientError::Transport {
            file_name: file_name.to_string(),
            chunk: index + 1,
            total,
            source,
        };

        let len = chunk.len() as u64;
        let part = Part::stream_with_length(chunk, len).file_name(file_name.to_string());
        let form = Form::new()
            .text(fields::CHUNK_INDEX, index.to_string())
            .text(fields::TOTAL_CHUNKS, total.to_string())
            .text(fields::FILE_NAME, file_name.to_string())
            .text(fields::FILE_TYPE, content_type.unwrap_or_default().to_string())
            .text(fields::UPLOAD_ID, upload_id.to_string())
            .part(fields::CHUNK, part);

        let resp = self
            .http
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        let body = resp.text().await.map_err(transport)?;

        if !status.is_success() {
            return Err(UploadClientError::ChunkRejected {
                file_name: file_name.to_string(),
                chunk: index + 1,
                total,
                status: status.as_u16(),
                message: error_field_or_snippet(status, &body),
            });
        }

        serde_json::from_str::<ChunkReply>(&body).map_err(|err| {
            UploadClientError::ChunkRejected {
                file_name: file_name.to_string(),
                chunk: index + 1,
                total,
                status: status.as_u16(),
                message: format!("unreadable reply: {err}"),
            }
        })
    }
}
