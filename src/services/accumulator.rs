//! Server-side chunk accumulation and reassembly.
//!
//! Each envelope is recorded in the session store under its `upload_id`.
//! When the final ordinal arrives and every ordinal is present, the chunks
//! are concatenated, checked against the object ceiling and written to the
//! storage sink under a fresh key.

use crate::{
    models::{
        chunk::{ChunkEnvelope, EnvelopeError},
        object::StoredObject,
    },
    services::{
        session_store::{ChunkWrite, SessionStore, SessionStoreError},
        storage_service::{
            DEFAULT_CONTENT_TYPE, LARGE_FILES_PREFIX, StorageError, StorageSink, derive_object_key,
        },
    },
};
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    InvalidEnvelope(#[from] EnvelopeError),
    #[error("`{file_name}` is incomplete: received {received} of {expected}, missing {missing:?}")]
    MissingChunks {
        file_name: String,
        received: usize,
        expected: u32,
        missing: Vec<u32>,
    },
    #[error("file is too large: {size} bytes exceeds the {limit_mib} MiB limit")]
    TooLarge { size: u64, limit_mib: u64 },
    #[error("upload failed: {0}")]
    Sink(StorageError),
    #[error(transparent)]
    Session(#[from] SessionStoreError),
}

impl UploadError {
    pub fn too_large(size: u64, limit: u64) -> Self {
        UploadError::TooLarge {
            size,
            limit_mib: limit / (1024 * 1024),
        }
    }

    /// Errors caused by what the client sent rather than by the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            UploadError::InvalidEnvelope(_)
                | UploadError::MissingChunks { .. }
                | UploadError::Session(SessionStoreError::TotalMismatch { .. })
        )
    }
}

/// What the accumulator did with one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Partial {
        chunk_index: u32,
        total_chunks: u32,
    },
    Complete {
        file_name: String,
        object: StoredObject,
    },
}

/// Receives chunks, detects completion and hands reassembled payloads to the
/// storage sink.
#[derive(Clone)]
pub struct ChunkAccumulator {
    sessions: Arc<dyn SessionStore>,
    sink: Arc<dyn StorageSink>,
    max_object_size: u64,
}

impl ChunkAccumulator {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        sink: Arc<dyn StorageSink>,
        max_object_size: u64,
    ) -> Self {
        Self {
            sessions,
            sink,
            max_object_size,
        }
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Record one chunk and, if it is the last ordinal, finish the upload.
    pub async fn accept(&self, envelope: ChunkEnvelope) -> Result<ChunkOutcome, UploadError> {
        let is_final = envelope.is_final();
        let ChunkEnvelope {
            chunk_index,
            total_chunks,
            file_name,
            file_type,
            upload_id,
            chunk,
        } = envelope;

        debug!(
            "received chunk {} of {} for {} ({} bytes, upload {})",
            chunk_index,
            total_chunks,
            file_name,
            chunk.len(),
            upload_id
        );

        let receipt = self
            .sessions
            .put_chunk(ChunkWrite {
                upload_id: &upload_id,
                file_name: &file_name,
                content_type: file_type.as_deref(),
                total_chunks,
                chunk_index,
                data: chunk,
            })
            .await?;

        if receipt.bytes_received > self.max_object_size {
            warn!(
                "upload {} for {} exceeded {} bytes while buffering, discarding",
                upload_id, file_name, self.max_object_size
            );
            self.sessions.delete(&upload_id).await?;
            return Err(UploadError::too_large(
                receipt.bytes_received,
                self.max_object_size,
            ));
        }

        if !is_final {
            return Ok(ChunkOutcome::Partial {
                chunk_index,
                total_chunks,
            });
        }

        info!("received last chunk for {}, combining...", file_name);

        // Session state survives a count mismatch so the client can resend
        // just the missing ordinals and then the final one again.
        let session = self.sessions.get(&upload_id).await?;
        let payload = session.as_ref().and_then(|s| s.reassemble());
        let (session, payload) = match (session, payload) {
            (Some(session), Some(payload)) if session.received() == total_chunks as usize => {
                (session, payload)
            }
            (session, _) => {
                let (received, missing) = session
                    .map(|s| (s.received(), s.missing()))
                    .unwrap_or_else(|| (0, (0..total_chunks).collect()));
                warn!(
                    "missing chunks for {}: received {} of {}",
                    file_name, received, total_chunks
                );
                return Err(UploadError::MissingChunks {
                    file_name,
                    received,
                    expected: total_chunks,
                    missing,
                });
            }
        };

        let size = payload.len() as u64;
        if size > self.max_object_size {
            warn!(
                "file too large: {} bytes (limit: {} bytes)",
                size, self.max_object_size
            );
            self.sessions.delete(&upload_id).await?;
            return Err(UploadError::too_large(size, self.max_object_size));
        }

        let content_type = session
            .content_type
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let result = self.store(&file_name, payload, &content_type).await;

        // Success or failure, the buffered chunks are no longer needed.
        if let Err(err) = self.sessions.delete(&upload_id).await {
            warn!("could not discard session {}: {}", upload_id, err);
        }

        let object = result?;
        info!(
            "upload {} complete: {} -> {}",
            upload_id, file_name, object.public_url
        );
        Ok(ChunkOutcome::Complete { file_name, object })
    }

    /// Write a whole payload to the sink under a freshly derived key. Shared
    /// by chunk reassembly and the direct upload path.
    pub async fn store(
        &self,
        file_name: &str,
        payload: Bytes,
        content_type: &str,
    ) -> Result<StoredObject, UploadError> {
        let size = payload.len() as u64;
        if size > self.max_object_size {
            return Err(UploadError::too_large(size, self.max_object_size));
        }

        let etag = format!("{:x}", md5::compute(&payload));
        let key = derive_object_key(LARGE_FILES_PREFIX, file_name);
        let locator = self
            .sink
            .put(&key, payload, content_type)
            .await
            .map_err(|err| match err {
                StorageError::TooLarge { size, limit } => UploadError::too_large(size, limit),
                other => UploadError::Sink(other),
            })?;
        let public_url = self
            .sink
            .public_url(&locator)
            .await
            .map_err(UploadError::Sink)?;

        Ok(StoredObject {
            locator,
            public_url,
            byte_size: size,
            content_type: content_type.to_string(),
            etag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::object::ObjectLocator, services::session_store::InMemorySessionStore,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Sink that keeps payloads in memory and records every call.
    #[derive(Default)]
    struct RecordingSink {
        puts: Mutex<Vec<(String, Bytes, String)>>,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl StorageSink for RecordingSink {
        fn max_object_size(&self) -> u64 {
            u64::MAX
        }

        async fn put(
            &self,
            key: &str,
            bytes: Bytes,
            content_type: &str,
        ) -> Result<ObjectLocator, StorageError> {
            if let Some(message) = &self.fail_with {
                return Err(StorageError::Io(std::io::Error::other(message.clone())));
            }
            self.puts
                .lock()
                .unwrap()
                .push((key.to_string(), bytes, content_type.to_string()));
            Ok(ObjectLocator(key.to_string()))
        }

        async fn public_url(&self, locator: &ObjectLocator) -> Result<String, StorageError> {
            Ok(format!("https://cdn.test/{locator}"))
        }
    }

    fn envelope(upload_id: &str, index: u32, total: u32, data: &[u8]) -> ChunkEnvelope {
        ChunkEnvelope {
            chunk_index: index,
            total_chunks: total,
            file_name: "louvor.mp3".into(),
            file_type: Some("audio/mpeg".into()),
            upload_id: upload_id.into(),
            chunk: Bytes::copy_from_slice(data),
        }
    }

    fn setup(
        limit: u64,
        sink: RecordingSink,
    ) -> (ChunkAccumulator, Arc<RecordingSink>, Arc<InMemorySessionStore>) {
        let sink = Arc::new(sink);
        let store = Arc::new(InMemorySessionStore::new());
        let acc = ChunkAccumulator::new(store.clone(), sink.clone(), limit);
        (acc, sink, store)
    }

    #[tokio::test]
    async fn reassembles_chunks_byte_for_byte() {
        let (acc, sink, store) = setup(1024, RecordingSink::default());
        let source: Vec<u8> = (0..=255u8).cycle().take(700).collect();
        let chunks: Vec<&[u8]> = source.chunks(256).collect();

        for (i, chunk) in chunks.iter().enumerate().take(2) {
            let out = acc.accept(envelope("u", i as u32, 3, chunk)).await.unwrap();
            assert_eq!(
                out,
                ChunkOutcome::Partial { chunk_index: i as u32, total_chunks: 3 }
            );
        }
        let out = acc.accept(envelope("u", 2, 3, chunks[2])).await.unwrap();

        let ChunkOutcome::Complete { file_name, object } = out else {
            panic!("expected completion");
        };
        assert_eq!(file_name, "louvor.mp3");
        assert_eq!(object.byte_size, 700);
        assert!(object.locator.as_str().starts_with("large-files/"));
        assert!(object.locator.as_str().ends_with(".mp3"));
        assert_eq!(object.public_url, format!("https://cdn.test/{}", object.locator));

        let puts = sink.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].1.as_ref(), source.as_slice());
        assert_eq!(puts[0].2, "audio/mpeg");
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn out_of_order_arrival_is_keyed_by_ordinal() {
        let (acc, sink, _) = setup(1024, RecordingSink::default());
        acc.accept(envelope("u", 1, 3, b"BB")).await.unwrap();
        acc.accept(envelope("u", 0, 3, b"AA")).await.unwrap();
        acc.accept(envelope("u", 2, 3, b"CC")).await.unwrap();
        assert_eq!(sink.puts.lock().unwrap()[0].1.as_ref(), b"AABBCC");
    }

    #[tokio::test]
    async fn missing_chunk_fails_and_keeps_state_for_retry() {
        let (acc, sink, store) = setup(1024, RecordingSink::default());
        acc.accept(envelope("u", 0, 3, b"AA")).await.unwrap();

        let err = acc.accept(envelope("u", 2, 3, b"CC")).await.unwrap_err();
        match &err {
            UploadError::MissingChunks { received, expected, missing, .. } => {
                assert_eq!(*received, 2);
                assert_eq!(*expected, 3);
                assert_eq!(missing, &vec![1]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_client_error());
        assert!(sink.puts.lock().unwrap().is_empty());
        assert_eq!(store.len().await.unwrap(), 1);

        acc.accept(envelope("u", 1, 3, b"BB")).await.unwrap();
        let out = acc.accept(envelope("u", 2, 3, b"CC")).await.unwrap();
        assert!(matches!(out, ChunkOutcome::Complete { .. }));
        assert_eq!(sink.puts.lock().unwrap()[0].1.as_ref(), b"AABBCC");
    }

    #[tokio::test]
    async fn oversize_is_rejected_without_touching_the_sink() {
        let (acc, sink, store) = setup(5, RecordingSink::default());
        acc.accept(envelope("u", 0, 2, b"abc")).await.unwrap();
        let err = acc.accept(envelope("u", 1, 2, b"def")).await.unwrap_err();

        assert!(matches!(err, UploadError::TooLarge { size: 6, .. }));
        assert!(sink.puts.lock().unwrap().is_empty());
        assert!(store.get("u").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversize_is_detected_while_still_buffering() {
        let (acc, sink, store) = setup(4, RecordingSink::default());
        let err = acc.accept(envelope("u", 0, 10, b"too many bytes")).await.unwrap_err();
        assert!(matches!(err, UploadError::TooLarge { .. }));
        assert!(sink.puts.lock().unwrap().is_empty());
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sink_failure_is_surfaced_and_session_discarded() {
        let sink = RecordingSink {
            fail_with: Some("bucket offline".into()),
            ..RecordingSink::default()
        };
        let (acc, _, store) = setup(1024, sink);
        let err = acc.accept(envelope("u", 0, 1, b"x")).await.unwrap_err();

        assert!(matches!(err, UploadError::Sink(_)));
        assert!(err.to_string().contains("bucket offline"));
        assert!(!err.is_client_error());
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn inconsistent_total_is_a_client_error() {
        let (acc, _, store) = setup(1024, RecordingSink::default());
        acc.accept(envelope("u", 0, 3, b"AA")).await.unwrap();
        let err = acc.accept(envelope("u", 1, 4, b"BB")).await.unwrap_err();
        assert!(err.is_client_error());
        assert_eq!(store.get("u").await.unwrap().unwrap().received(), 1);
    }

    #[tokio::test]
    async fn interleaved_uploads_keep_separate_sessions() {
        let (acc, sink, store) = setup(1024, RecordingSink::default());
        acc.accept(envelope("a", 0, 2, b"a0")).await.unwrap();
        acc.accept(envelope("b", 0, 2, b"b0")).await.unwrap();
        acc.accept(envelope("a", 1, 2, b"a1")).await.unwrap();

        assert_eq!(sink.puts.lock().unwrap()[0].1.as_ref(), b"a0a1");
        let b = store.get("b").await.unwrap().unwrap();
        assert_eq!(b.received(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_uploads_do_not_interfere() {
        let (acc, sink, store) = setup(64 * 1024, RecordingSink::default());

        let tasks: Vec<_> = (0..8u8)
            .map(|n| {
                let acc = acc.clone();
                tokio::spawn(async move {
                    let upload_id = format!("upload-{n}");
                    let mut last = None;
                    for index in 0..10u32 {
                        let out = acc.accept(envelope(&upload_id, index, 10, &[n; 100])).await;
                        last = Some(out.unwrap());
                    }
                    last.unwrap()
                })
            })
            .collect();

        for task in tasks {
            let out = task.await.unwrap();
            assert!(matches!(out, ChunkOutcome::Complete { .. }));
        }

        let puts = sink.puts.lock().unwrap();
        assert_eq!(puts.len(), 8);
        for (_, bytes, _) in puts.iter() {
            assert_eq!(bytes.len(), 1000);
            assert!(bytes.iter().all(|b| *b == bytes[0]));
        }
        let mut firsts: Vec<u8> = puts.iter().map(|(_, bytes, _)| bytes[0]).collect();
        firsts.sort();
        assert_eq!(firsts, (0..8).collect::<Vec<u8>>());
        drop(puts);
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn same_file_name_never_reuses_a_key() {
        let (acc, sink, _) = setup(1024, RecordingSink::default());
        acc.accept(envelope("one", 0, 1, b"x")).await.unwrap();
        acc.accept(envelope("two", 0, 1, b"y")).await.unwrap();
        let puts = sink.puts.lock().unwrap();
        assert_ne!(puts[0].0, puts[1].0);
    }

    #[tokio::test]
    async fn missing_content_type_defaults_to_octet_stream() {
        let (acc, sink, _) = setup(1024, RecordingSink::default());
        let mut env = envelope("u", 0, 1, b"x");
        env.file_type = None;
        acc.accept(env).await.unwrap();
        assert_eq!(sink.puts.lock().unwrap()[0].2, DEFAULT_CONTENT_TYPE);
    }
}
