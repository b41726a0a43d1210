//! In-process attachment host for development and tests

use super::{Attachment, AttachmentHost, HostError, HostedBatch, NoticeRef};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

const MEMORY_CHANNEL: &str = "memory";

#[derive(Default)]
struct HostState {
    batches: BTreeMap<String, Vec<Attachment>>,
    notices: BTreeMap<String, String>,
    upload_calls: usize,
    delete_attempts: usize,
    fail_uploads_from: Option<usize>,
    failing_batches: HashSet<String>,
    fail_notice_deletes: bool,
}

/// Attachment host keeping everything in memory
#[derive(Default)]
pub struct MemoryHost {
    state: Mutex<HostState>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every upload call from the `n`th (zero-based) on
    pub fn fail_uploads_from(&self, n: usize) {
        self.state.lock().fail_uploads_from = Some(n);
    }

    /// Make deleting `batch_ref` fail
    pub fn fail_delete_of(&self, batch_ref: &str) {
        self.state.lock().failing_batches.insert(batch_ref.to_string());
    }

    /// Make every notice deletion fail
    pub fn fail_notice_deletes(&self) {
        self.state.lock().fail_notice_deletes = true;
    }

    /// Number of upload calls received, including failed ones
    pub fn upload_calls(&self) -> usize {
        self.state.lock().upload_calls
    }

    /// Number of delete calls received, batches and notices together
    pub fn delete_attempts(&self) -> usize {
        self.state.lock().delete_attempts
    }

    /// Attachment counts of the stored batches, keyed by batch ref
    pub fn batch_sizes(&self) -> BTreeMap<String, usize> {
        self.state
            .lock()
            .batches
            .iter()
            .map(|(batch_ref, attachments)| (batch_ref.clone(), attachments.len()))
            .collect()
    }

    /// Contents behind a URL handed out by this host
    pub fn fetch(&self, url: &str) -> Option<Bytes> {
        let path = url.strip_prefix("memory://")?;
        let (batch_ref, name) = path.split_once('/')?;
        self.state
            .lock()
            .batches
            .get(batch_ref)?
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.data.clone())
    }

    /// Text of a stored notice
    pub fn notice(&self, message_id: &str) -> Option<String> {
        self.state.lock().notices.get(message_id).cloned()
    }
}

#[async_trait]
impl AttachmentHost for MemoryHost {
    async fn upload_batch(&self, attachments: Vec<Attachment>) -> Result<HostedBatch, HostError> {
        let mut state = self.state.lock();
        let call = state.upload_calls;
        state.upload_calls += 1;

        if state.fail_uploads_from.is_some_and(|from| call >= from) {
            return Err(HostError::Rejected {
                status: 503,
                message: "memory host configured to fail".to_string(),
            });
        }

        let batch_ref = Uuid::new_v4().to_string();
        let urls = attachments
            .iter()
            .map(|a| format!("memory://{}/{}", batch_ref, a.name))
            .collect();
        state.batches.insert(batch_ref.clone(), attachments);

        Ok(HostedBatch { batch_ref, urls })
    }

    async fn delete_batch(&self, batch_ref: &str) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.delete_attempts += 1;

        if state.failing_batches.contains(batch_ref) {
            return Err(HostError::Rejected {
                status: 500,
                message: format!("memory host refused to delete {}", batch_ref),
            });
        }

        state
            .batches
            .remove(batch_ref)
            .map(|_| ())
            .ok_or_else(|| HostError::NotFound(batch_ref.to_string()))
    }

    async fn post_notice(&self, content: &str) -> Result<NoticeRef, HostError> {
        let message_id = Uuid::new_v4().to_string();
        self.state
            .lock()
            .notices
            .insert(message_id.clone(), content.to_string());

        Ok(NoticeRef {
            channel_id: MEMORY_CHANNEL.to_string(),
            message_id,
        })
    }

    async fn delete_notice(&self, notice: &NoticeRef) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.delete_attempts += 1;

        if state.fail_notice_deletes {
            return Err(HostError::Rejected {
                status: 500,
                message: "memory host configured to fail notice deletes".to_string(),
            });
        }

        state
            .notices
            .remove(&notice.message_id)
            .map(|_| ())
            .ok_or_else(|| HostError::NotFound(notice.message_id.clone()))
    }
}
