//! Remote attachment hosts.
//!
//! A host stores byte blobs in batches ("messages") and hands back a durable
//! URL per blob. Parts of a file are grouped into batches by the part
//! uploader; the deletion coordinator removes whole batches again. The same
//! host also carries the short text notice announcing a finished upload.

pub mod memory;
pub mod s3;
pub mod webhook;

use crate::config::HostConfig;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub use memory::MemoryHost;
pub use s3::S3Host;
pub use webhook::WebhookHost;

/// Errors reported by an attachment host
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Host request failed: {0}")]
    Request(String),

    #[error("Host rejected the request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Batch of {size} attachments exceeds the host limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("Malformed host response: {0}")]
    Malformed(String),

    #[error("Not found on host: {0}")]
    NotFound(String),

    #[error("Rate limited by host, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },
}

/// A named blob to upload
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub data: Bytes,
}

impl Attachment {
    pub fn new(name: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Result of one batch upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedBatch {
    /// Host-assigned identifier of the message holding the batch
    pub batch_ref: String,
    /// One URL per attachment, in upload order
    pub urls: Vec<String>,
}

/// Location of a posted notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeRef {
    pub channel_id: String,
    pub message_id: String,
}

/// Storage for batches of attachments
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AttachmentHost: Send + Sync {
    /// Upload every attachment as one batch
    async fn upload_batch(&self, attachments: Vec<Attachment>) -> Result<HostedBatch, HostError>;

    /// Delete a batch and all attachments in it
    async fn delete_batch(&self, batch_ref: &str) -> Result<(), HostError>;

    /// Post a text notice
    async fn post_notice(&self, content: &str) -> Result<NoticeRef, HostError>;

    /// Delete a previously posted notice
    async fn delete_notice(&self, notice: &NoticeRef) -> Result<(), HostError>;
}

/// Build the host selected in configuration
pub async fn from_config(config: &HostConfig) -> Result<Arc<dyn AttachmentHost>> {
    let host: Arc<dyn AttachmentHost> = match config {
        HostConfig::Webhook(webhook) => Arc::new(WebhookHost::new(webhook)?),
        HostConfig::S3(s3) => Arc::new(S3Host::new(s3).await?),
        HostConfig::Memory => Arc::new(MemoryHost::new()),
    };
    Ok(host)
}
