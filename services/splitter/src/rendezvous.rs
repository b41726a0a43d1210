//! Rendezvous between token issuance and the HTTP upload.
//!
//! The issuer of a token and the request that later uploads with it never see
//! each other. Both go through the [`RendezvousBroker`]: `issue` opens a
//! pending upload keyed by file ID, the upload handler settles it, and whoever
//! holds the [`Completion`] handle learns the outcome.

use crate::part_registry::PartRegistry;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Random bytes per token; 24 bytes encode to 32 URL-safe characters
const TOKEN_BYTES: usize = 24;

/// Outcome of a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub file_id: String,
    pub filename: String,
    pub file_size: u64,
}

/// Why a pending upload did not complete
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadFailure {
    #[error("File is empty")]
    Empty,

    #[error("Attachment host rejected the upload: {0}")]
    HostRejected(String),

    #[error("Upload body failed: {0}")]
    Body(String),

    #[error("Failed to record the upload: {0}")]
    Storage(String),

    #[error("File exceeds the limit of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("Upload token expired before the upload started")]
    Expired,

    #[error("Upload was retracted")]
    Retracted,
}

/// Broker errors
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Registry error: {0}")]
    Registry(#[from] anyhow::Error),

    #[error("File {0} already exists")]
    FileExists(String),

    #[error("No pending upload found for {0}")]
    NoPendingUpload(String),

    #[error("Completion of {0} is already being awaited")]
    AlreadyAwaited(String),

    #[error("Upload failed: {0}")]
    Failed(UploadFailure),

    #[error("Timed out waiting for the upload")]
    TimedOut,

    #[error("Stopped waiting for the upload")]
    Cancelled,

    #[error("Pending upload was dropped without an outcome")]
    Dropped,
}

type Outcome = Result<UploadReport, UploadFailure>;

struct PendingUpload {
    resolver: oneshot::Sender<Outcome>,
    waiter: Option<oneshot::Receiver<Outcome>>,
    deadline_ms: i64,
    in_flight: bool,
}

/// A freshly issued upload token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at_ms: i64,
}

/// Handle resolving once the upload of one file is settled
#[derive(Debug)]
pub struct Completion {
    file_id: String,
    receiver: oneshot::Receiver<Outcome>,
}

impl Completion {
    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// Wait for the outcome
    pub async fn wait(self) -> Result<UploadReport, BrokerError> {
        match self.receiver.await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(failure)) => Err(BrokerError::Failed(failure)),
            Err(_) => Err(BrokerError::Dropped),
        }
    }

    /// Wait for the outcome, giving up after `timeout`. Giving up does not
    /// affect the upload itself.
    pub async fn wait_for(self, timeout: Duration) -> Result<UploadReport, BrokerError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| BrokerError::TimedOut)?
    }

    /// Wait for the outcome until `cancel` fires
    pub async fn wait_cancellable(self, cancel: &CancellationToken) -> Result<UploadReport, BrokerError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BrokerError::Cancelled),
            outcome = self.wait() => outcome,
        }
    }
}

/// In-process table of pending uploads
pub struct RendezvousBroker {
    registry: Arc<PartRegistry>,
    pending: Mutex<HashMap<String, PendingUpload>>,
    token_lifespan: Duration,
}

impl RendezvousBroker {
    pub fn new(registry: Arc<PartRegistry>, token_lifespan: Duration) -> Self {
        Self {
            registry,
            pending: Mutex::new(HashMap::new()),
            token_lifespan,
        }
    }

    /// Issue an upload token for `file_id`.
    ///
    /// Returns `None` when an upload for the same file is already pending; the
    /// repeated trigger is ignored.
    #[instrument(skip(self))]
    pub async fn issue(&self, file_id: &str, owner_id: &str) -> Result<Option<IssuedToken>, BrokerError> {
        let token = generate_token();
        let expires_at_ms = Utc::now().timestamp_millis() + self.token_lifespan.as_millis() as i64;

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(file_id) {
                debug!("Duplicate upload request suppressed");
                return Ok(None);
            }
            let (resolver, waiter) = oneshot::channel();
            pending.insert(
                file_id.to_string(),
                PendingUpload {
                    resolver,
                    waiter: Some(waiter),
                    deadline_ms: expires_at_ms,
                    in_flight: false,
                },
            );
        }

        if let Err(e) = self.open_row(file_id, owner_id, &token, expires_at_ms).await {
            self.pending.lock().remove(file_id);
            return Err(e);
        }

        info!(expires_at_ms = expires_at_ms, "Upload token issued");
        Ok(Some(IssuedToken { token, expires_at_ms }))
    }

    async fn open_row(
        &self,
        file_id: &str,
        owner_id: &str,
        token: &str,
        expires_at_ms: i64,
    ) -> Result<(), BrokerError> {
        if self.registry.file(file_id).await?.is_some() {
            return Err(BrokerError::FileExists(file_id.to_string()));
        }
        self.registry
            .open_upload(file_id, owner_id, token, expires_at_ms)
            .await?;
        Ok(())
    }

    /// Take the completion handle of a pending upload. Only one handle exists
    /// per issued token.
    pub fn await_completion(&self, file_id: &str) -> Result<Completion, BrokerError> {
        let mut pending = self.pending.lock();
        let entry = pending
            .get_mut(file_id)
            .ok_or_else(|| BrokerError::NoPendingUpload(file_id.to_string()))?;
        let receiver = entry
            .waiter
            .take()
            .ok_or_else(|| BrokerError::AlreadyAwaited(file_id.to_string()))?;

        Ok(Completion {
            file_id: file_id.to_string(),
            receiver,
        })
    }

    /// Mark the upload of `file_id` as started, which exempts it from the
    /// expiry sweep. Returns whether a pending upload exists.
    pub fn begin(&self, file_id: &str) -> bool {
        match self.pending.lock().get_mut(file_id) {
            Some(entry) => {
                entry.in_flight = true;
                true
            }
            None => false,
        }
    }

    /// Deliver the outcome of an upload and forget the pending entry
    #[instrument(skip(self, outcome), fields(success = outcome.is_ok()))]
    pub fn settle(&self, file_id: &str, outcome: Outcome) -> Result<(), BrokerError> {
        let entry = self
            .pending
            .lock()
            .remove(file_id)
            .ok_or_else(|| BrokerError::NoPendingUpload(file_id.to_string()))?;

        let unawaited = entry.waiter.is_some();
        if entry.resolver.send(outcome).is_err() || unawaited {
            info!("Upload settled but nobody is waiting for it");
        } else {
            debug!("Upload settled");
        }
        Ok(())
    }

    /// Drop pending uploads whose token expired before their upload began
    pub fn sweep_expired(&self, now_ms: i64) -> Vec<String> {
        let expired: Vec<(String, PendingUpload)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| !entry.in_flight && entry.deadline_ms < now_ms)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let mut swept = Vec::with_capacity(expired.len());
        for (file_id, entry) in expired {
            debug!(file_id = %file_id, "Pending upload expired");
            let _ = entry.resolver.send(Err(UploadFailure::Expired));
            swept.push(file_id);
        }

        if !swept.is_empty() {
            info!(count = swept.len(), "Expired pending uploads swept");
        }
        swept
    }

    /// Withdraw a pending upload: its waiter is released and the token closed
    #[instrument(skip(self))]
    pub async fn retract(&self, file_id: &str) -> Result<(), BrokerError> {
        let entry = self
            .pending
            .lock()
            .remove(file_id)
            .ok_or_else(|| BrokerError::NoPendingUpload(file_id.to_string()))?;

        if entry.in_flight {
            warn!("Retracting an upload that is already streaming");
        }
        let _ = entry.resolver.send(Err(UploadFailure::Retracted));

        self.registry.close_upload(file_id).await?;
        info!("Pending upload retracted");
        Ok(())
    }

    /// Whether an upload for `file_id` is pending
    pub fn is_pending(&self, file_id: &str) -> bool {
        self.pending.lock().contains_key(file_id)
    }

    /// Number of pending uploads
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Generate a random URL-safe upload token
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
