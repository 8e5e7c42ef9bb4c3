//! Direct upload of small files and streaming reads of stored objects.

use crate::{
    errors::AppError,
    models::object::ObjectRecord,
    services::storage_service::DEFAULT_CONTENT_TYPE,
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tracing::info;

/// Multipart field carrying the payload on `POST /api/upload`.
pub const FILE_FIELD: &str = "file";

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadReply {
    pub success: bool,
    pub file_url: String,
    pub file_name: String,
    pub file_size: u64,
}

/// `POST /api/upload`: a whole file in one request, for payloads that fit in
/// a single body.
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadReply>, AppError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let file_name = field
            .file_name()
            .filter(|name| !name.is_empty())
            .unwrap_or("upload")
            .to_string();
        let content_type = field
            .content_type()
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let payload = field.bytes().await?;
        info!("direct upload of {} ({} bytes)", file_name, payload.len());

        let object = state
            .accumulator
            .store(&file_name, payload, &content_type)
            .await?;
        return Ok(Json(UploadReply {
            success: true,
            file_url: object.public_url,
            file_name,
            file_size: object.byte_size,
        }));
    }

    Err(AppError::bad_request("No file provided"))
}

/// `GET /files/{*key}`: stream a stored object.
pub async fn get_file(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let (meta, file) = state.storage.get_object_reader(&key).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &ObjectRecord) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE)),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(meta.size_bytes.max(0) as u64),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.created_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
