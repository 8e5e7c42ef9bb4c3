//! Splits sources above the per-object ceiling into independently uploaded
//! parts named `{name}.parte{i}de{n}`.
//!
//! Parts are uploaded one after another and are never stitched back into a
//! single object; the caller keeps the ordered list.

use crate::client::chunk_uploader::{ChunkUploader, RemoteObject, UploadClientError};
use bytes::Bytes;
use std::ops::Range;
use tracing::info;

/// One slice of an oversized source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPlan {
    /// 0-based part ordinal.
    pub index: usize,
    pub count: usize,
    pub range: Range<usize>,
    pub name: String,
}

pub fn part_name(file_name: &str, index: usize, count: usize) -> String {
    format!("{}.parte{}de{}", file_name, index + 1, count)
}

/// Cut `size` bytes into `ceil(size / ceiling)` consecutive ranges of at most
/// `ceiling` bytes.
pub fn plan_parts(size: usize, ceiling: usize, file_name: &str) -> Vec<PartPlan> {
    let ceiling = ceiling.max(1);
    let count = size.div_ceil(ceiling);
    (0..count)
        .map(|index| {
            let start = index * ceiling;
            PartPlan {
                index,
                count,
                range: start..size.min(start + ceiling),
                name: part_name(file_name, index, count),
            }
        })
        .collect()
}

/// Result of [`ChunkUploader::upload_large_object`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadResult {
    Single(RemoteObject),
    /// Parts in source order.
    Split(Vec<RemoteObject>),
}

impl UploadResult {
    pub fn urls(&self) -> Vec<&str> {
        match self {
            UploadResult::Single(obj) => vec![obj.url.as_str()],
            UploadResult::Split(parts) => parts.iter().map(|p| p.url.as_str()).collect(),
        }
    }
}

impl ChunkUploader {
    /// Upload a source of any size up to the absolute source ceiling.
    ///
    /// Sources within the object ceiling go up as one object; larger ones are
    /// split into parts, each pushed through [`ChunkUploader::upload_object`]
    /// sequentially. Progress is reported over the whole source. When a part
    /// fails the remaining parts are skipped and the error lists the parts
    /// that were already stored.
    pub async fn upload_large_object<F>(
        &self,
        source: Bytes,
        file_name: &str,
        content_type: Option<&str>,
        mut on_progress: F,
    ) -> Result<UploadResult, UploadClientError>
    where
        F: FnMut(f64),
    {
        let size = source.len() as u64;
        if size > self.policy.max_source_size {
            return Err(UploadClientError::SourceTooLarge {
                size,
                limit: self.policy.max_source_size,
            });
        }

        if size <= self.policy.max_object_size {
            let object = self
                .upload_object(source, file_name, content_type, on_progress)
                .await?;
            return Ok(UploadResult::Single(object));
        }

        let plan = plan_parts(
            source.len(),
            self.policy.max_object_size as usize,
            file_name,
        );
        let parts = plan.len();
        info!(
            "{} is {} bytes, splitting into {} parts",
            file_name, size, parts
        );

        let mut completed = Vec::with_capacity(parts);
        for part in plan {
            info!(
                "sending part {}/{}: {} ({} bytes)",
                part.index + 1,
                parts,
                part.name,
                part.range.len()
            );
            let offset = part.index as f64;
            let result = self
                .upload_object(
                    source.slice(part.range.clone()),
                    &part.name,
                    content_type,
                    |p| on_progress((offset + p) / parts as f64),
                )
                .await;

            match result {
                Ok(object) => completed.push(object),
                Err(err) => {
                    return Err(UploadClientError::PartFailed {
                        part: part.index + 1,
                        parts,
                        completed,
                        source: Box::new(err),
                    });
                }
            }
        }

        info!("all {} parts of {} sent", parts, file_name);
        Ok(UploadResult::Split(completed))
    }
}
