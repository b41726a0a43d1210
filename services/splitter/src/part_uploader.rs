//! Batching of frames into attachment host uploads.
//!
//! Frames are staged until a batch of `batch_size` is full, then sent to the
//! host in one call. The URLs that come back are registered in a single
//! registry transaction before the next batch is sent, which keeps parts in
//! stream order.

use crate::attachment_host::{Attachment, AttachmentHost, HostError};
use crate::config::UploadConfig;
use crate::frame_slicer::FrameSlicer;
use crate::part_registry::{NewPart, PartRegistry};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that abort an upload
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Attachment host failed: {0}")]
    Host(#[from] HostError),

    #[error("Host returned {got} URLs for {expected} parts")]
    UrlCountMismatch { expected: usize, got: usize },

    #[error("Upload exceeds the limit of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("Failed to register parts: {0}")]
    Registry(#[from] anyhow::Error),

    #[error("Failed to stage part: {0}")]
    Spool(#[from] std::io::Error),

    #[error("Upload stream failed: {0}")]
    Body(String),
}

/// Settings shared by every upload
#[derive(Debug, Clone)]
pub struct UploaderSettings {
    /// Bytes per part
    pub frame_size: NonZeroUsize,
    /// Parts per host call
    pub batch_size: usize,
    /// Largest accepted upload
    pub max_file_size: u64,
    /// Directory for staged frames, memory if unset
    pub spool_dir: Option<PathBuf>,
}

impl From<&UploadConfig> for UploaderSettings {
    fn from(config: &UploadConfig) -> Self {
        Self {
            frame_size: config.frame_size(),
            batch_size: config.batch_size.max(1),
            max_file_size: config.max_file_size_bytes,
            spool_dir: config.spool_dir.clone(),
        }
    }
}

/// Totals of a finished upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadSummary {
    pub parts: usize,
    pub batches: usize,
    pub total_bytes: u64,
}

/// A frame waiting for its batch
enum StagedFrame {
    Memory(Bytes),
    /// Removed from disk when dropped
    Spooled(NamedTempFile),
}

impl StagedFrame {
    async fn load(&self) -> Result<Bytes, UploadError> {
        match self {
            StagedFrame::Memory(data) => Ok(data.clone()),
            StagedFrame::Spooled(file) => Ok(Bytes::from(tokio::fs::read(file.path()).await?)),
        }
    }
}

/// Uploads the parts of one file
pub struct PartUploader {
    host: Arc<dyn AttachmentHost>,
    registry: Arc<PartRegistry>,
    settings: UploaderSettings,
    file_id: String,
    filename: String,
    staged: Vec<(i64, usize, StagedFrame)>,
    next_index: i64,
    summary: UploadSummary,
}

impl PartUploader {
    pub fn new(
        host: Arc<dyn AttachmentHost>,
        registry: Arc<PartRegistry>,
        settings: UploaderSettings,
        file_id: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        let batch_size = settings.batch_size.max(1);
        Self {
            host,
            registry,
            staged: Vec::with_capacity(batch_size),
            settings,
            file_id: file_id.into(),
            filename: filename.into(),
            next_index: 0,
            summary: UploadSummary::default(),
        }
    }

    /// Slice a byte stream into frames and upload all of them
    #[instrument(skip(self, stream), fields(file_id = %self.file_id))]
    pub async fn upload_stream<S, E>(mut self, stream: S) -> Result<UploadSummary, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let mut slicer = FrameSlicer::new(self.settings.frame_size);
        let mut received: u64 = 0;
        futures::pin_mut!(stream);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| UploadError::Body(e.to_string()))?;
            received += chunk.len() as u64;
            if received > self.settings.max_file_size {
                warn!(received = received, "Upload exceeded the size limit");
                return Err(UploadError::TooLarge {
                    limit: self.settings.max_file_size,
                });
            }

            for frame in slicer.push(&chunk) {
                self.push_frame(frame).await?;
            }
        }

        if let Some(frame) = slicer.finish() {
            self.push_frame(frame).await?;
        }

        self.finish().await
    }

    /// Stage one frame, sending the batch once it is full
    pub async fn push_frame(&mut self, frame: Bytes) -> Result<(), UploadError> {
        let len = frame.len();
        let staged = match self.settings.spool_dir {
            Some(ref dir) => {
                let file = tempfile::Builder::new()
                    .prefix("splitter-part-")
                    .tempfile_in(dir)?;
                tokio::fs::write(file.path(), &frame).await?;
                StagedFrame::Spooled(file)
            }
            None => StagedFrame::Memory(frame),
        };

        self.staged.push((self.next_index, len, staged));
        self.next_index += 1;

        if self.staged.len() >= self.settings.batch_size {
            self.flush_batch().await?;
        }
        Ok(())
    }

    /// Send the final short batch, if any
    pub async fn finish(mut self) -> Result<UploadSummary, UploadError> {
        if !self.staged.is_empty() {
            self.flush_batch().await?;
        }

        info!(
            file_id = %self.file_id,
            parts = self.summary.parts,
            batches = self.summary.batches,
            total_bytes = self.summary.total_bytes,
            "Upload finished"
        );
        Ok(self.summary)
    }

    /// Remove a hosted batch that no part entry will ever point at
    async fn discard_batch(&self, batch_ref: &str) {
        if let Err(e) = self.host.delete_batch(batch_ref).await {
            warn!(batch_ref = %batch_ref, error = %e, "Failed to remove unregistered batch");
        }
    }

    async fn flush_batch(&mut self) -> Result<(), UploadError> {
        let staged = std::mem::take(&mut self.staged);
        let mut attachments = Vec::with_capacity(staged.len());
        for (index, _, frame) in &staged {
            attachments.push(Attachment::new(
                format!("{}.part{}", self.filename, index),
                frame.load().await?,
            ));
        }

        let started = Instant::now();
        let batch = self.host.upload_batch(attachments).await?;
        metrics::histogram!("splitter.batch.upload_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        if batch.urls.len() != staged.len() {
            self.discard_batch(&batch.batch_ref).await;
            return Err(UploadError::UrlCountMismatch {
                expected: staged.len(),
                got: batch.urls.len(),
            });
        }

        let parts: Vec<NewPart> = staged
            .iter()
            .zip(batch.urls)
            .map(|((index, len, _), url)| NewPart {
                part_index: *index,
                url,
                size_bytes: *len as i64,
            })
            .collect();
        let batch_bytes: u64 = parts.iter().map(|p| p.size_bytes as u64).sum();

        if let Err(e) = self
            .registry
            .add_parts(&self.file_id, &batch.batch_ref, &parts)
            .await
        {
            self.discard_batch(&batch.batch_ref).await;
            return Err(e.into());
        }

        self.summary.parts += parts.len();
        self.summary.batches += 1;
        self.summary.total_bytes += batch_bytes;

        metrics::counter!("splitter.parts.uploaded").increment(parts.len() as u64);
        metrics::counter!("splitter.batches.uploaded").increment(1);
        metrics::counter!("splitter.bytes.uploaded").increment(batch_bytes);

        debug!(
            batch_ref = %batch.batch_ref,
            first_part = parts.first().map(|p| p.part_index).unwrap_or_default(),
            count = parts.len(),
            "Batch registered"
        );

        // Staged files are removed here
        drop(staged);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment_host::{HostedBatch, MemoryHost, MockAttachmentHost};
    use std::convert::Infallible;

    async fn registry_with_file(file_id: &str) -> Arc<PartRegistry> {
        let registry = PartRegistry::in_memory().await.unwrap();
        registry
            .open_upload(file_id, "owner", "token", i64::MAX)
            .await
            .unwrap();
        Arc::new(registry)
    }

    fn settings(frame_size: usize, batch_size: usize) -> UploaderSettings {
        UploaderSettings {
            frame_size: NonZeroUsize::new(frame_size).unwrap(),
            batch_size,
            max_file_size: 1024 * 1024,
            spool_dir: None,
        }
    }

    fn body(chunks: Vec<Vec<u8>>) -> impl Stream<Item = Result<Bytes, Infallible>> {
        futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))))
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_batch_count_and_sizes() {
        let host = Arc::new(MemoryHost::new());
        let registry = registry_with_file("f1").await;

        // 23 frames of 4 bytes (last one short) with batches of 10
        let data = sample(4 * 22 + 3);
        let uploader = PartUploader::new(host.clone(), registry.clone(), settings(4, 10), "f1", "a.bin");
        let summary = uploader
            .upload_stream(body(vec![data[..50].to_vec(), data[50..].to_vec()]))
            .await
            .unwrap();

        assert_eq!(summary.parts, 23);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.total_bytes, data.len() as u64);
        assert_eq!(host.upload_calls(), 3);

        let mut sizes: Vec<usize> = host.batch_sizes().values().copied().collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![3, 10, 10]);
    }

    #[tokio::test]
    async fn test_exact_multiple_of_batch_size() {
        let host = Arc::new(MemoryHost::new());
        let registry = registry_with_file("f1").await;

        let uploader = PartUploader::new(host.clone(), registry, settings(5, 2), "f1", "a.bin");
        let summary = uploader.upload_stream(body(vec![sample(20)])).await.unwrap();

        assert_eq!(summary.parts, 4);
        assert_eq!(host.upload_calls(), 2);
        assert!(host.batch_sizes().values().all(|&n| n == 2));
    }

    #[tokio::test]
    async fn test_parts_reassemble_original_bytes() {
        let host = Arc::new(MemoryHost::new());
        let registry = registry_with_file("f1").await;
        let data = sample(97);

        let uploader = PartUploader::new(host.clone(), registry.clone(), settings(8, 3), "f1", "clip.mp4");
        uploader
            .upload_stream(body(vec![data[..7].to_vec(), data[7..60].to_vec(), data[60..].to_vec()]))
            .await
            .unwrap();

        let mut reassembled = Vec::new();
        for url in registry.part_urls("f1").await.unwrap() {
            assert!(url.contains("clip.mp4.part"));
            reassembled.extend_from_slice(&host.fetch(&url).unwrap());
        }
        assert_eq!(reassembled, data);
    }

    #[tokio::test]
    async fn test_spooled_frames_are_uploaded_and_removed() {
        let spool = tempfile::tempdir().unwrap();
        let host = Arc::new(MemoryHost::new());
        let registry = registry_with_file("f1").await;
        let mut settings = settings(4, 3);
        settings.spool_dir = Some(spool.path().to_path_buf());
        let data = sample(30);

        let uploader = PartUploader::new(host.clone(), registry.clone(), settings, "f1", "a.bin");
        uploader.upload_stream(body(vec![data.clone()])).await.unwrap();

        let mut reassembled = Vec::new();
        for url in registry.part_urls("f1").await.unwrap() {
            reassembled.extend_from_slice(&host.fetch(&url).unwrap());
        }
        assert_eq!(reassembled, data);
        assert_eq!(std::fs::read_dir(spool.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_host_failure_keeps_committed_batches_only() {
        let host = Arc::new(MemoryHost::new());
        host.fail_uploads_from(1);
        let registry = registry_with_file("f1").await;

        let uploader = PartUploader::new(host.clone(), registry.clone(), settings(4, 2), "f1", "a.bin");
        let result = uploader.upload_stream(body(vec![sample(40)])).await;

        assert!(matches!(result, Err(UploadError::Host(_))));
        // Aborted on the second call, nothing after it was attempted
        assert_eq!(host.upload_calls(), 2);
        assert_eq!(registry.parts("f1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_stream_is_cut_off() {
        let host = Arc::new(MemoryHost::new());
        let registry = registry_with_file("f1").await;
        let mut settings = settings(4, 10);
        settings.max_file_size = 10;

        let uploader = PartUploader::new(host.clone(), registry.clone(), settings, "f1", "a.bin");
        let result = uploader
            .upload_stream(body(vec![sample(8), sample(8)]))
            .await;

        assert!(matches!(result, Err(UploadError::TooLarge { limit: 10 })));
        assert_eq!(host.upload_calls(), 0);
        assert!(registry.parts("f1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_stream_uploads_nothing() {
        let host = Arc::new(MemoryHost::new());
        let registry = registry_with_file("f1").await;

        let uploader = PartUploader::new(host.clone(), registry, settings(4, 10), "f1", "a.bin");
        let summary = uploader.upload_stream(body(vec![vec![], vec![]])).await.unwrap();

        assert_eq!(summary, UploadSummary::default());
        assert_eq!(host.upload_calls(), 0);
    }

    #[tokio::test]
    async fn test_url_count_mismatch_is_rejected() {
        let mut host = MockAttachmentHost::new();
        host.expect_upload_batch().times(1).returning(|_| {
            Ok(HostedBatch {
                batch_ref: "b1".to_string(),
                urls: vec!["https://cdn/only-one".to_string()],
            })
        });
        host.expect_delete_batch()
            .withf(|batch_ref| batch_ref == "b1")
            .times(1)
            .returning(|_| Ok(()));
        let registry = registry_with_file("f1").await;

        let uploader = PartUploader::new(Arc::new(host), registry.clone(), settings(4, 2), "f1", "a.bin");
        let result = uploader.upload_stream(body(vec![sample(8)])).await;

        assert!(matches!(
            result,
            Err(UploadError::UrlCountMismatch { expected: 2, got: 1 })
        ));
        assert!(registry.parts("f1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registry_failure_removes_hosted_batch() {
        let host = Arc::new(MemoryHost::new());
        // No files row, so the part insert violates the foreign key
        let registry = Arc::new(PartRegistry::in_memory().await.unwrap());

        let uploader = PartUploader::new(host.clone(), registry.clone(), settings(4, 2), "ghost", "a.bin");
        let result = uploader.upload_stream(body(vec![sample(8)])).await;

        assert!(matches!(result, Err(UploadError::Registry(_))));
        assert_eq!(host.upload_calls(), 1);
        assert!(host.batch_sizes().is_empty());
        assert_eq!(host.delete_attempts(), 1);
    }

    #[tokio::test]
    async fn test_body_error_aborts() {
        let host = Arc::new(MemoryHost::new());
        let registry = registry_with_file("f1").await;
        let stream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"abcd")),
            Err("connection reset"),
        ]);

        let uploader = PartUploader::new(host, registry, settings(4, 10), "f1", "a.bin");
        assert!(matches!(
            uploader.upload_stream(stream).await,
            Err(UploadError::Body(_))
        ));
    }
}
