//! Drive endpoints: token hand-off for browser clients and server-side
//! uploads.

use crate::{
    client::drive::DriveError,
    errors::AppError,
    handlers::object_handlers::{FILE_FIELD, UploadReply},
    services::storage_service::DEFAULT_CONTENT_TYPE,
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, State},
};
use serde::Serialize;
use tracing::{debug, info};

/// Required form field naming the content record the file belongs to.
pub const CONTENT_ID_FIELD: &str = "contentId";

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DriveTokenReply {
    pub access_token: String,
    pub folder_id: Option<String>,
    pub expires_in: Option<u64>,
}

/// `GET /api/drive-token`: exchange the configured refresh token so a
/// browser client can talk to Drive directly.
pub async fn drive_token(
    State(state): State<AppState>,
) -> Result<Json<DriveTokenReply>, AppError> {
    let drive = state.drive.as_ref().ok_or(DriveError::NotConfigured)?;
    let token = drive.auth.access_token().await?;
    Ok(Json(DriveTokenReply {
        access_token: token.access_token,
        folder_id: drive.folder_id.clone(),
        expires_in: token.expires_in,
    }))
}

/// `POST /api/drive-upload`: receive a whole file and push it to Drive,
/// replying with its public view URL.
pub async fn drive_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadReply>, AppError> {
    let drive = state.drive.as_ref().ok_or(DriveError::NotConfigured)?;

    let mut file = None;
    let mut content_id = None;
    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some(FILE_FIELD) => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or(DEFAULT_CONTENT_TYPE)
                    .to_string();
                file = Some((file_name, content_type, field.bytes().await?));
            }
            Some(CONTENT_ID_FIELD) => content_id = Some(field.text().await?),
            other => debug!("ignoring unexpected form field {:?}", other),
        }
    }

    let (Some((file_name, content_type, payload)), Some(content_id)) =
        (file, content_id.filter(|id| !id.is_empty()))
    else {
        return Err(AppError::bad_request(format!(
            "both `{FILE_FIELD}` and `{CONTENT_ID_FIELD}` are required"
        )));
    };

    info!(
        "uploading {} ({} bytes) to Drive for content {}",
        file_name,
        payload.len(),
        content_id
    );
    let file_size = payload.len() as u64;
    let uploaded = drive
        .client()
        .await?
        .upload(payload, &file_name, &content_type, |p| {
            debug!("{}: {:.0}%", file_name, p * 100.0)
        })
        .await?;

    Ok(Json(UploadReply {
        success: true,
        file_url: uploaded.view_url,
        file_name,
        file_size,
    }))
}
