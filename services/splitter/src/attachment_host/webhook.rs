//! Chat webhook attachment host.
//!
//! Each batch is a single webhook message carrying up to
//! [`MAX_ATTACHMENTS_PER_MESSAGE`] files. The message id doubles as the batch
//! reference, so deleting the message deletes every part in it.

use super::{Attachment, AttachmentHost, HostError, HostedBatch, NoticeRef};
use crate::config::WebhookConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Attachments a single webhook message may carry
pub const MAX_ATTACHMENTS_PER_MESSAGE: usize = 10;

/// Longest `retry_after` honoured from a 429 answer
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// Message returned by the webhook when posted with `wait=true`
#[derive(Debug, Deserialize)]
struct WebhookMessage {
    id: String,
    channel_id: String,
    #[serde(default)]
    attachments: Vec<WebhookAttachment>,
}

#[derive(Debug, Deserialize)]
struct WebhookAttachment {
    filename: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: f64,
}

/// Attachment host posting batches through a chat webhook
pub struct WebhookHost {
    client: Client,
    url: String,
    retry_initial_interval: Duration,
    retry_max_elapsed: Duration,
}

impl WebhookHost {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build webhook HTTP client")?;

        info!("Webhook attachment host initialized");

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            retry_initial_interval: Duration::from_millis(config.retry_initial_interval_ms),
            retry_max_elapsed: Duration::from_secs(config.retry_max_elapsed_secs),
        })
    }

    fn message_url(&self, message_id: &str) -> String {
        format!("{}/messages/{}", self.url, message_id)
    }

    fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.retry_initial_interval,
            max_interval: MAX_RATE_LIMIT_WAIT,
            max_elapsed_time: Some(self.retry_max_elapsed),
            ..Default::default()
        }
    }

    /// Send a request, retrying throttled, failed and 5xx attempts with backoff.
    /// Other answers, 4xx included, are returned to the caller.
    async fn send(
        &self,
        build: impl Fn() -> Result<RequestBuilder, HostError>,
    ) -> Result<Response, HostError> {
        let build = &build;
        backoff::future::retry_notify(
            self.retry_policy(),
            || async move {
                let response = build()
                    .map_err(backoff::Error::permanent)?
                    .send()
                    .await
                    .map_err(|e| backoff::Error::transient(HostError::Request(e.to_string())))?;

                let status = response.status();
                if status == StatusCode::TOO_MANY_REQUESTS {
                    let wait = rate_limit_wait(response).await;
                    return Err(backoff::Error::retry_after(
                        HostError::RateLimited {
                            retry_after_ms: wait.as_millis() as u64,
                        },
                        wait,
                    ));
                }
                if status.is_server_error() {
                    let message = response.text().await.unwrap_or_default();
                    return Err(backoff::Error::transient(HostError::Rejected {
                        status: status.as_u16(),
                        message,
                    }));
                }
                Ok::<_, backoff::Error<HostError>>(response)
            },
            |e: HostError, wait: Duration| {
                warn!(error = %e, wait_ms = wait.as_millis() as u64, "Webhook request failed, retrying");
            },
        )
        .await
    }

    async fn post_message(
        &self,
        build: impl Fn() -> Result<RequestBuilder, HostError>,
    ) -> Result<WebhookMessage, HostError> {
        let response = check_status(self.send(build).await?).await?;
        response
            .json::<WebhookMessage>()
            .await
            .map_err(|e| HostError::Malformed(e.to_string()))
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), HostError> {
        let url = self.message_url(message_id);
        let response = self.send(|| Ok(self.client.delete(&url))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(HostError::NotFound(message_id.to_string()));
        }
        check_status(response).await?;
        debug!(message_id = %message_id, "Webhook message deleted");
        Ok(())
    }
}

#[async_trait]
impl AttachmentHost for WebhookHost {
    #[instrument(skip(self, attachments), fields(count = attachments.len()))]
    async fn upload_batch(&self, attachments: Vec<Attachment>) -> Result<HostedBatch, HostError> {
        if attachments.len() > MAX_ATTACHMENTS_PER_MESSAGE {
            return Err(HostError::BatchTooLarge {
                size: attachments.len(),
                limit: MAX_ATTACHMENTS_PER_MESSAGE,
            });
        }

        let names: Vec<String> = attachments.iter().map(|a| a.name.clone()).collect();
        let payload = json!({
            "attachments": names
                .iter()
                .enumerate()
                .map(|(i, name)| json!({ "id": i, "filename": name }))
                .collect::<Vec<_>>(),
        })
        .to_string();

        // The form is rebuilt per attempt; cloning `Bytes` does not copy the data
        let message = self
            .post_message(|| {
                let mut form = Form::new().text("payload_json", payload.clone());
                for (i, attachment) in attachments.iter().enumerate() {
                    let part = Part::stream(attachment.data.clone())
                        .file_name(attachment.name.clone())
                        .mime_str("application/octet-stream")
                        .map_err(|e| HostError::Request(e.to_string()))?;
                    form = form.part(format!("files[{}]", i), part);
                }
                Ok(self
                    .client
                    .post(&self.url)
                    .query(&[("wait", "true")])
                    .multipart(form))
            })
            .await?;

        let urls = match_attachment_urls(&names, &message.attachments)?;
        debug!(message_id = %message.id, "Batch posted to webhook");

        Ok(HostedBatch {
            batch_ref: message.id,
            urls,
        })
    }

    async fn delete_batch(&self, batch_ref: &str) -> Result<(), HostError> {
        self.delete_message(batch_ref).await
    }

    async fn post_notice(&self, content: &str) -> Result<NoticeRef, HostError> {
        let body = json!({
            "content": content,
            "allowed_mentions": { "parse": [] },
        });
        let message = self
            .post_message(|| {
                Ok(self
                    .client
                    .post(&self.url)
                    .query(&[("wait", "true")])
                    .json(&body))
            })
            .await?;

        Ok(NoticeRef {
            channel_id: message.channel_id,
            message_id: message.id,
        })
    }

    async fn delete_notice(&self, notice: &NoticeRef) -> Result<(), HostError> {
        self.delete_message(&notice.message_id).await
    }
}

async fn check_status(response: Response) -> Result<Response, HostError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(HostError::Rejected {
        status: status.as_u16(),
        message,
    })
}

/// Read the wait advertised by a 429 answer
async fn rate_limit_wait(response: Response) -> Duration {
    response
        .json::<RateLimitBody>()
        .await
        .ok()
        .and_then(|body| Duration::try_from_secs_f64(body.retry_after).ok())
        .unwrap_or(Duration::from_secs(1))
        .min(MAX_RATE_LIMIT_WAIT)
}

/// Order the returned attachment URLs like the names that were sent.
/// When the host renamed the files, the message order is used as is.
fn match_attachment_urls(
    names: &[String],
    attachments: &[WebhookAttachment],
) -> Result<Vec<String>, HostError> {
    if attachments.len() != names.len() {
        return Err(HostError::Malformed(format!(
            "sent {} attachments, message holds {}",
            names.len(),
            attachments.len()
        )));
    }

    let by_name: Option<Vec<String>> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            // Same position first, then any attachment with the same name
            let by_position = attachments.get(i).filter(|a| &a.filename == name);
            by_position
                .or_else(|| attachments.iter().find(|a| &a.filename == name))
                .map(|a| a.url.clone())
        })
        .collect();

    Ok(by_name.unwrap_or_else(|| {
        debug!("Attachment names were rewritten, matching by position");
        attachments.iter().map(|a| a.url.clone()).collect()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn attachment(filename: &str, url: &str) -> WebhookAttachment {
        WebhookAttachment {
            filename: filename.to_string(),
            url: url.to_string(),
        }
    }

    #[test]
    fn test_match_attachment_urls_reorders_by_name() {
        let names = vec!["f.part0".to_string(), "f.part1".to_string()];
        let returned = vec![attachment("f.part1", "https://cdn/1"), attachment("f.part0", "https://cdn/0")];

        let urls = match_attachment_urls(&names, &returned).unwrap();
        assert_eq!(urls, vec!["https://cdn/0", "https://cdn/1"]);
    }

    #[test]
    fn test_match_attachment_urls_falls_back_to_position() {
        let names = vec!["my file.part0".to_string(), "my file.part1".to_string()];
        let returned = vec![
            attachment("my_file.part0", "https://cdn/0"),
            attachment("my_file.part1", "https://cdn/1"),
        ];

        let urls = match_attachment_urls(&names, &returned).unwrap();
        assert_eq!(urls, vec!["https://cdn/0", "https://cdn/1"]);
    }

    #[test]
    fn test_match_attachment_urls_rejects_count_mismatch() {
        let names = vec!["f.part0".to_string(), "f.part1".to_string()];
        let returned = vec![attachment("f.part0", "https://cdn/0")];

        assert!(matches!(
            match_attachment_urls(&names, &returned),
            Err(HostError::Malformed(_))
        ));
    }

    #[test]
    fn test_deserialize_webhook_message() {
        let json = r#"{
            "id": "1122334455",
            "channel_id": "998877",
            "content": "",
            "attachments": [
                {"id": "1", "filename": "movie.mkv.part0", "size": 10, "url": "https://cdn.example/a/movie.mkv.part0"}
            ]
        }"#;

        let message: WebhookMessage = serde_json::from_str(json).unwrap();
        assert_eq!(message.id, "1122334455");
        assert_eq!(message.channel_id, "998877");
        assert_eq!(message.attachments[0].filename, "movie.mkv.part0");
    }

    fn config(url: String) -> WebhookConfig {
        WebhookConfig {
            url,
            retry_initial_interval_ms: 10,
            retry_max_elapsed_secs: 5,
            request_timeout_secs: 5,
        }
    }

    /// Serve a webhook that answers with `statuses` in turn, then succeeds
    async fn scripted_webhook(statuses: Vec<StatusCode>) -> (String, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/api/webhooks/1/token",
            post(move |_body: Bytes| {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                let status = statuses.get(call).copied();
                async move {
                    match status {
                        Some(StatusCode::TOO_MANY_REQUESTS) => (
                            StatusCode::TOO_MANY_REQUESTS,
                            Json(json!({ "retry_after": 0.01 })),
                        ),
                        Some(status) => (status, Json(json!({ "message": "scripted failure" }))),
                        None => (
                            StatusCode::OK,
                            Json(json!({
                                "id": "m1",
                                "channel_id": "c1",
                                "attachments": [{ "filename": "f.part0", "url": "https://cdn/0" }]
                            })),
                        ),
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{}/api/webhooks/1/token", addr), calls)
    }

    fn one_part() -> Vec<Attachment> {
        vec![Attachment::new("f.part0", Bytes::from_static(b"abcd"))]
    }

    #[tokio::test]
    async fn test_upload_batch_retries_transient_failures() {
        let (url, calls) = scripted_webhook(vec![
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
        ])
        .await;
        let host = WebhookHost::new(&config(url)).unwrap();

        let batch = host.upload_batch(one_part()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(batch.batch_ref, "m1");
        assert_eq!(batch.urls, vec!["https://cdn/0"]);
    }

    #[tokio::test]
    async fn test_upload_batch_does_not_retry_client_errors() {
        let (url, calls) = scripted_webhook(vec![StatusCode::BAD_REQUEST]).await;
        let host = WebhookHost::new(&config(url)).unwrap();

        let result = host.upload_batch(one_part()).await;

        assert!(matches!(result, Err(HostError::Rejected { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_upload_batch_gives_up_after_max_elapsed() {
        let (url, calls) = scripted_webhook(vec![StatusCode::BAD_GATEWAY; 1000]).await;
        let host = WebhookHost::new(&WebhookConfig {
            retry_max_elapsed_secs: 0,
            ..config(url)
        })
        .unwrap();

        let result = host.upload_batch(one_part()).await;

        assert!(matches!(result, Err(HostError::Rejected { status: 502, .. })));
        assert!(calls.load(Ordering::SeqCst) < 1000);
    }

    #[tokio::test]
    async fn test_upload_batch_rejects_oversized_batch() {
        let host = WebhookHost::new(&config("http://127.0.0.1:9/api/webhooks/1/token".to_string())).unwrap();

        let attachments = (0..11)
            .map(|i| Attachment::new(format!("f.part{}", i), Bytes::new()))
            .collect();

        assert!(matches!(
            host.upload_batch(attachments).await,
            Err(HostError::BatchTooLarge { size: 11, limit: 10 })
        ));
    }
}
