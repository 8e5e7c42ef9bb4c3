//! Defines routes for the upload service.
//!
//! ## Structure
//! - **Upload endpoints**
//!   - `POST /api/chunk-upload`: one chunk of a chunked upload
//!   - `POST /api/upload`: whole small file in one request
//!   - `GET  /api/drive-token`: short-lived Drive access token
//!   - `POST /api/drive-upload`: whole file pushed on to Drive
//!
//! - **Object endpoints**
//!   - `GET  /files/{*key}`: stream a stored object (target of public URLs)
//!
//! The wildcard `*key` allows nested keys like `large-files/1718000000000-abc.pdf`.

use crate::{
    config::MIB,
    handlers::{
        chunk_handlers::submit_chunk,
        drive_handlers::{drive_token, drive_upload},
        health_handlers::{healthz, readyz},
        object_handlers::{get_file, upload_file},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. Each upload route carries its own body limit: one chunk
/// for `/api/chunk-upload`, the object ceiling plus multipart overhead for
/// `/api/upload`, the source ceiling plus overhead for `/api/drive-upload`.
pub fn routes(
    chunk_body_limit: usize,
    max_object_size: u64,
    max_source_size: u64,
) -> Router<AppState> {
    let direct_limit = with_overhead(max_object_size);
    let drive_limit = with_overhead(max_source_size);

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/api/chunk-upload",
            post(submit_chunk).layer(DefaultBodyLimit::max(chunk_body_limit)),
        )
        .route(
            "/api/upload",
            post(upload_file).layer(DefaultBodyLimit::max(direct_limit)),
        )
        .route("/api/drive-token", get(drive_token))
        .route(
            "/api/drive-upload",
            post(drive_upload).layer(DefaultBodyLimit::max(drive_limit)),
        )
        .route("/files/{*key}", get(get_file))
}

fn with_overhead(ceiling: u64) -> usize {
    usize::try_from(ceiling.saturating_add(MIB)).unwrap_or(usize::MAX)
}
