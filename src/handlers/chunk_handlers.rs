//! `POST /api/chunk-upload`: one chunk per request.

use crate::{
    errors::AppError,
    models::chunk::{ChunkForm, ChunkReply, fields},
    services::accumulator::ChunkOutcome,
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, State},
};
use tracing::debug;

/// Collect the multipart fields, validate them and hand the chunk to the
/// accumulator. Unknown fields are ignored.
pub async fn submit_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ChunkReply>, AppError> {
    let mut form = ChunkForm::default();

    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        match name.as_str() {
            fields::CHUNK => form.chunk = Some(field.bytes().await?),
            fields::CHUNK_INDEX => form.chunk_index = Some(field.text().await?),
            fields::TOTAL_CHUNKS => form.total_chunks = Some(field.text().await?),
            fields::FILE_NAME => form.file_name = Some(field.text().await?),
            fields::FILE_TYPE => form.file_type = Some(field.text().await?),
            fields::UPLOAD_ID => form.upload_id = Some(field.text().await?),
            other => debug!("ignoring unexpected form field {}", other),
        }
    }

    let envelope = form.into_envelope()?;
    let reply = match state.accumulator.accept(envelope).await? {
        ChunkOutcome::Partial {
            chunk_index,
            total_chunks,
        } => ChunkReply::partial(chunk_index, total_chunks),
        ChunkOutcome::Complete { file_name, object } => {
            ChunkReply::complete(object.public_url, file_name, object.byte_size)
        }
    };
    Ok(Json(reply))
}
