use crate::{
    client::{
        drive::{DEFAULT_API_BASE, DEFAULT_UPLOAD_BASE, DriveClient, DriveError},
        drive_auth::DriveAuth,
    },
    config::DriveSettings,
    services::{accumulator::ChunkAccumulator, storage_service::LocalDiskSink},
};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub accumulator: ChunkAccumulator,
    /// Concrete sink, for streaming objects back out and readiness checks.
    pub storage: LocalDiskSink,
    /// `None` when Drive credentials are not configured.
    pub drive: Option<DriveTarget>,
}

/// Credentials and endpoints for server-side Drive access.
#[derive(Clone)]
pub struct DriveTarget {
    pub auth: DriveAuth,
    pub folder_id: Option<String>,
    pub upload_base: String,
    pub api_base: String,
    pub chunk_size: usize,
}

impl DriveTarget {
    pub fn from_settings(settings: &DriveSettings, chunk_size: usize) -> Result<Self, DriveError> {
        Ok(Self {
            auth: DriveAuth::from_settings(settings)?,
            folder_id: settings.folder_id.clone(),
            upload_base: settings
                .upload_base
                .clone()
                .unwrap_or_else(|| DEFAULT_UPLOAD_BASE.to_string()),
            api_base: settings
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            chunk_size,
        })
    }

    /// Exchange the refresh token and build a client for one upload.
    pub async fn client(&self) -> Result<DriveClient, DriveError> {
        let token = self.auth.access_token().await?;
        Ok(DriveClient::new(token.access_token, self.folder_id.clone())?
            .with_endpoints(self.upload_base.as_str(), self.api_base.as_str())
            .with_chunk_size(self.chunk_size))
    }
}
