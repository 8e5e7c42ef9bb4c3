//! Wire shapes for the chunk submit endpoint.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Multipart field names, shared by the server handler and the client.
pub mod fields {
    pub const CHUNK_INDEX: &str = "chunkIndex";
    pub const TOTAL_CHUNKS: &str = "totalChunks";
    pub const FILE_NAME: &str = "fileName";
    pub const FILE_TYPE: &str = "fileType";
    pub const UPLOAD_ID: &str = "fileId";
    pub const CHUNK: &str = "chunk";
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("missing required field `{0}`")]
    Missing(&'static str),
    #[error("field `{field}` is not a valid chunk number: `{value}`")]
    NotANumber { field: &'static str, value: String },
    #[error("totalChunks must be at least 1")]
    NoChunks,
    #[error("chunkIndex {index} is out of range for {total} chunks")]
    IndexOutOfRange { index: u32, total: u32 },
}

/// One chunk of one upload, as received.
#[derive(Clone, Debug)]
pub struct ChunkEnvelope {
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub file_name: String,
    pub file_type: Option<String>,
    pub upload_id: String,
    pub chunk: Bytes,
}

impl ChunkEnvelope {
    pub fn is_final(&self) -> bool {
        self.chunk_index + 1 == self.total_chunks
    }
}

/// Raw multipart fields before validation. Every field is optional here so
/// the handler can collect whatever arrived and report what is missing.
#[derive(Debug, Default)]
pub struct ChunkForm {
    pub chunk_index: Option<String>,
    pub total_chunks: Option<String>,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub upload_id: Option<String>,
    pub chunk: Option<Bytes>,
}

impl ChunkForm {
    pub fn into_envelope(self) -> Result<ChunkEnvelope, EnvelopeError> {
        let chunk_index = required(self.chunk_index, fields::CHUNK_INDEX)?;
        let total_chunks = required(self.total_chunks, fields::TOTAL_CHUNKS)?;
        let file_name = required(self.file_name, fields::FILE_NAME)?;
        let upload_id = required(self.upload_id, fields::UPLOAD_ID)?;
        let chunk = self.chunk.ok_or(EnvelopeError::Missing(fields::CHUNK))?;

        let chunk_index = parse_ordinal(fields::CHUNK_INDEX, &chunk_index)?;
        let total_chunks = parse_ordinal(fields::TOTAL_CHUNKS, &total_chunks)?;
        if total_chunks == 0 {
            return Err(EnvelopeError::NoChunks);
        }
        if chunk_index >= total_chunks {
            return Err(EnvelopeError::IndexOutOfRange {
                index: chunk_index,
                total: total_chunks,
            });
        }

        Ok(ChunkEnvelope {
            chunk_index,
            total_chunks,
            file_name,
            file_type: self.file_type.filter(|t| !t.trim().is_empty()),
            upload_id,
            chunk,
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, EnvelopeError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(EnvelopeError::Missing(field))
}

fn parse_ordinal(field: &'static str, value: &str) -> Result<u32, EnvelopeError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| EnvelopeError::NotANumber {
            field,
            value: value.to_string(),
        })
}

/// JSON body returned for every accepted chunk.
///
/// Partial replies carry `chunkIndex`/`totalChunks`; the completing reply
/// carries `fileUrl`/`fileName`/`fileSize`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

impl ChunkReply {
    pub fn partial(chunk_index: u32, total_chunks: u32) -> Self {
        Self {
            success: true,
            is_complete: false,
            chunk_index: Some(chunk_index),
            total_chunks: Some(total_chunks),
            ..Self::default()
        }
    }

    pub fn complete(file_url: String, file_name: String, file_size: u64) -> Self {
        Self {
            success: true,
            is_complete: true,
            file_url: Some(file_url),
            file_name: Some(file_name),
            file_size: Some(file_size),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form() -> ChunkForm {
        ChunkForm {
            chunk_index: Some("1".into()),
            total_chunks: Some("3".into()),
            file_name: Some("report.pdf".into()),
            file_type: Some("application/pdf".into()),
            upload_id: Some("1718000000000abc".into()),
            chunk: Some(Bytes::from_static(b"payload")),
        }
    }

    #[test]
    fn complete_form_becomes_envelope() {
        let env = form().into_envelope().unwrap();
        assert_eq!(env.chunk_index, 1);
        assert_eq!(env.total_chunks, 3);
        assert_eq!(env.file_type.as_deref(), Some("application/pdf"));
        assert!(!env.is_final());
    }

    #[test]
    fn missing_upload_id_is_reported_by_name() {
        let mut f = form();
        f.upload_id = None;
        assert_eq!(
            f.into_envelope().unwrap_err(),
            EnvelopeError::Missing(fields::UPLOAD_ID)
        );
    }

    #[test]
    fn missing_chunk_payload_is_rejected() {
        let mut f = form();
        f.chunk = None;
        assert_eq!(
            f.into_envelope().unwrap_err(),
            EnvelopeError::Missing(fields::CHUNK)
        );
    }

    #[test]
    fn blank_file_type_is_treated_as_absent() {
        let mut f = form();
        f.file_type = Some(String::new());
        assert_eq!(f.into_envelope().unwrap().file_type, None);
    }

    #[test]
    fn index_must_be_below_total() {
        let mut f = form();
        f.chunk_index = Some("3".into());
        assert_eq!(
            f.into_envelope().unwrap_err(),
            EnvelopeError::IndexOutOfRange { index: 3, total: 3 }
        );
    }

    #[test]
    fn non_numeric_ordinal_is_rejected() {
        let mut f = form();
        f.total_chunks = Some("three".into());
        assert!(matches!(
            f.into_envelope().unwrap_err(),
            EnvelopeError::NotANumber { field: fields::TOTAL_CHUNKS, .. }
        ));
    }

    #[test]
    fn partial_reply_omits_file_fields() {
        let json = serde_json::to_value(ChunkReply::partial(0, 2)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "success": true,
                "isComplete": false,
                "chunkIndex": 0,
                "totalChunks": 2
            })
        );
    }
}
