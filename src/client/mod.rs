//! HTTP clients: the chunk uploader that feeds the accumulator, the
//! oversized-file part splitter on top of it, and the resumable Drive client.

pub mod chunk_uploader;
pub mod drive;
pub mod drive_auth;
pub mod part_splitter;

use reqwest::StatusCode;

const SNIPPET_CHARS: usize = 100;

/// First characters of a response body, for errors that carry no JSON.
fn snippet(body: &str) -> String {
    let mut out: String = body.chars().take(SNIPPET_CHARS).collect();
    if body.chars().nth(SNIPPET_CHARS).is_some() {
        out.push_str("...");
    }
    out
}

/// Message for a failed response: the compact JSON body when it parses,
/// otherwise the status and a truncated body.
pub(crate) fn json_or_snippet(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => value.to_string(),
        Err(_) => format!("{} - {}", status, snippet(body)),
    }
}

/// Message for a failed response from our own server: its `error` field when
/// present, otherwise the status and a truncated body.
pub(crate) fn error_field_or_snippet(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| format!("{} - {}", status, snippet(body)))
}
