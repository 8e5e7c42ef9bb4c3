//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks DB connectivity, disk I/O and the
//!   session store

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness check that:
/// 1. Runs `SELECT 1` against SQLite.
/// 2. Writes, reads back and deletes a temp file under the storage directory.
/// 3. Asks the session store how many uploads are in flight.
///
/// HTTP 200 when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let storage = &state.storage;

    let sqlite_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*storage.db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };

    let tmp_path = storage.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
    let disk_check = check_disk(tmp_path).await;

    let sessions_check = match state.accumulator.sessions().len().await {
        Ok(count) => CheckStatus {
            ok: true,
            error: None,
            in_flight: Some(count),
        },
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };

    let overall_ok = sqlite_check.ok && disk_check.ok && sessions_check.ok;
    let checks = HashMap::from([
        ("sqlite", sqlite_check),
        ("disk", disk_check),
        ("sessions", sessions_check),
    ]);

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn check_disk(tmp_path: std::path::PathBuf) -> CheckStatus {
    if let Some(parent) = tmp_path.parent() {
        if let Err(e) = fs::create_dir_all(parent).await {
            return CheckStatus::failed(format!("could not create storage dir: {}", e));
        }
    }
    if let Err(e) = fs::write(&tmp_path, b"readyz").await {
        return CheckStatus::failed(format!("could not write tmp file: {}", e));
    }
    let result = match fs::read(&tmp_path).await {
        Ok(bytes) if bytes == b"readyz" => CheckStatus::ok(),
        Ok(_) => CheckStatus::failed("file content mismatch".to_string()),
        Err(e) => CheckStatus::failed(format!("could not read tmp file: {}", e)),
    };
    match fs::remove_file(&tmp_path).await {
        Err(e) if result.ok => CheckStatus {
            error: Some(format!("could not remove tmp file: {}", e)),
            ..result
        },
        _ => result,
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    in_flight: Option<usize>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            in_flight: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
            in_flight: None,
        }
    }
}
