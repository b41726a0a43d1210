//! Upload token issuance for triggers such as chat commands.
//!
//! A trigger asks for an upload link and returns it to the user right away.
//! A background task then waits for the upload to complete and posts a notice
//! linking to the file.

use crate::attachment_host::{AttachmentHost, NoticeRef};
use crate::part_registry::PartRegistry;
use crate::rendezvous::{BrokerError, Completion, RendezvousBroker, UploadReport};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Link handed to the user who asked to upload
#[derive(Debug, Clone, Serialize)]
pub struct UploadLink {
    pub file_id: String,
    pub token: String,
    pub upload_url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct UploadIssuer {
    broker: Arc<RendezvousBroker>,
    registry: Arc<PartRegistry>,
    host: Arc<dyn AttachmentHost>,
    webapp_url: String,
    completion_timeout: Duration,
    shutdown: CancellationToken,
}

impl UploadIssuer {
    pub fn new(
        broker: Arc<RendezvousBroker>,
        registry: Arc<PartRegistry>,
        host: Arc<dyn AttachmentHost>,
        webapp_url: &str,
        completion_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            broker,
            registry,
            host,
            webapp_url: webapp_url.trim_end_matches('/').to_string(),
            completion_timeout,
            shutdown,
        }
    }

    /// Issue an upload link and announce the file once it is uploaded.
    ///
    /// Returns `None` if an upload for `file_id` is already pending.
    pub async fn request_upload(&self, file_id: &str, owner_id: &str) -> Result<Option<UploadLink>, BrokerError> {
        let (link, _) = match self.request_upload_tracked(file_id, owner_id).await? {
            Some(issued) => issued,
            None => return Ok(None),
        };
        Ok(Some(link))
    }

    /// Like [`request_upload`](Self::request_upload), also returning the
    /// follow-up task, which yields the posted notice
    pub async fn request_upload_tracked(
        &self,
        file_id: &str,
        owner_id: &str,
    ) -> Result<Option<(UploadLink, JoinHandle<Option<NoticeRef>>)>, BrokerError> {
        let issued = match self.broker.issue(file_id, owner_id).await? {
            Some(issued) => issued,
            None => return Ok(None),
        };
        let completion = self.broker.await_completion(file_id)?;

        let link = UploadLink {
            file_id: file_id.to_string(),
            upload_url: format!("{}/upload/{}", self.webapp_url, issued.token),
            expires_at: Utc
                .timestamp_millis_opt(issued.expires_at_ms)
                .single()
                .unwrap_or_else(Utc::now),
            token: issued.token,
        };

        let issuer = self.clone();
        let owner_id = owner_id.to_string();
        let span = tracing::info_span!("upload_follow_up", file_id = %file_id);
        let follow_up = tokio::spawn(async move { issuer.follow_up(completion, &owner_id).await }.instrument(span));

        Ok(Some((link, follow_up)))
    }

    /// Withdraw an upload link that has not been used
    pub async fn retract(&self, file_id: &str) -> Result<(), BrokerError> {
        self.broker.retract(file_id).await
    }

    async fn follow_up(&self, completion: Completion, owner_id: &str) -> Option<NoticeRef> {
        let outcome = tokio::time::timeout(
            self.completion_timeout,
            completion.wait_cancellable(&self.shutdown),
        )
        .await
        .unwrap_or(Err(BrokerError::TimedOut));

        match outcome {
            Ok(report) => match self.announce(&report, owner_id).await {
                Ok(notice) => {
                    metrics::counter!("splitter.uploads.completed").increment(1);
                    Some(notice)
                }
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "Failed to announce upload");
                    None
                }
            },
            Err(BrokerError::Failed(failure)) => {
                metrics::counter!("splitter.uploads.failed").increment(1);
                info!(reason = %failure, "Upload did not complete");
                None
            }
            Err(BrokerError::TimedOut) => {
                info!("Stopped waiting for upload");
                None
            }
            Err(e) => {
                debug!(error = %e, "Upload follow-up ended");
                None
            }
        }
    }

    async fn announce(&self, report: &UploadReport, owner_id: &str) -> Result<NoticeRef> {
        let content = notice_text(&self.webapp_url, owner_id, report);
        let notice = self
            .host
            .post_notice(&content)
            .await
            .context("Failed to post upload notice")?;

        self.registry.set_upload_info(&report.file_id, &notice).await?;
        info!(message_id = %notice.message_id, "Upload announced");
        Ok(notice)
    }
}

fn notice_text(webapp_url: &str, owner_id: &str, report: &UploadReport) -> String {
    format!(
        "<@{}> posted a file: {}/file/{}/{}\n{}",
        owner_id,
        webapp_url,
        report.file_id,
        report.filename,
        human_file_size(report.file_size)
    )
}

/// Format a byte count with base-1024 units and two decimals
pub fn human_file_size(bytes: u64) -> String {
    const THRESHOLD: f64 = 1024.0;
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    value /= THRESHOLD;
    // Move up a unit when rounding would print 1024.00
    while (value * 100.0).round() / 100.0 >= THRESHOLD && unit < UNITS.len() - 1 {
        value /= THRESHOLD;
        unit += 1;
    }

    format!("{:.2} {}", value, UNITS[unit])
}
