//! Server-side state for one in-flight chunked upload.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Chunks received so far for a single `upload_id`.
///
/// Ordinals are the map keys, so iteration order is reassembly order no
/// matter in which order the chunks arrived.
#[derive(Clone, Debug)]
pub struct UploadSession {
    pub upload_id: String,
    pub file_name: String,
    pub content_type: Option<String>,
    /// Chunk count declared by the client; identical on every envelope.
    pub total_chunks: u32,
    pub chunks: BTreeMap<u32, Bytes>,
    pub bytes_received: u64,
    pub created_at: DateTime<Utc>,
    /// Last chunk arrival, used for idle eviction.
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(
        upload_id: impl Into<String>,
        file_name: impl Into<String>,
        content_type: Option<String>,
        total_chunks: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            upload_id: upload_id.into(),
            file_name: file_name.into(),
            content_type,
            total_chunks,
            chunks: BTreeMap::new(),
            bytes_received: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Insert (or replace) the payload for `index` and keep the byte tally
    /// consistent with what is actually held.
    pub fn insert(&mut self, index: u32, data: Bytes) {
        let added = data.len() as u64;
        if let Some(previous) = self.chunks.insert(index, data) {
            self.bytes_received -= previous.len() as u64;
        }
        self.bytes_received += added;
        self.updated_at = Utc::now();
    }

    /// Number of distinct ordinals held.
    pub fn received(&self) -> usize {
        self.chunks.len()
    }

    /// Ordinals in `0..total_chunks` that have not arrived yet.
    pub fn missing(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.chunks.contains_key(i))
            .collect()
    }

    /// Concatenate every chunk in ordinal order.
    ///
    /// Returns `None` when any ordinal in `0..total_chunks` is absent.
    pub fn reassemble(&self) -> Option<Bytes> {
        let mut buf = BytesMut::with_capacity(self.bytes_received as usize);
        for index in 0..self.total_chunks {
            buf.extend_from_slice(self.chunks.get(&index)?);
        }
        Some(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_out_of_order_chunks_in_ordinal_order() {
        let mut session = UploadSession::new("u1", "a.txt", None, 3);
        session.insert(2, Bytes::from_static(b"ghi"));
        session.insert(0, Bytes::from_static(b"abc"));
        session.insert(1, Bytes::from_static(b"def"));

        assert_eq!(session.received(), 3);
        assert_eq!(session.bytes_received, 9);
        assert_eq!(session.reassemble().unwrap(), Bytes::from_static(b"abcdefghi"));
    }

    #[test]
    fn duplicate_chunk_replaces_payload_and_tally() {
        let mut session = UploadSession::new("u1", "a.txt", None, 2);
        session.insert(0, Bytes::from_static(b"abcdef"));
        session.insert(0, Bytes::from_static(b"ab"));

        assert_eq!(session.received(), 1);
        assert_eq!(session.bytes_received, 2);
        assert_eq!(session.missing(), vec![1]);
        assert!(session.reassemble().is_none());
    }
}
