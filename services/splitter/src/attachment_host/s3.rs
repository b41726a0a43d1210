use super::{Attachment, AttachmentHost, HostError, HostedBatch, NoticeRef};
use crate::config::S3Config;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Attachment host backed by an S3 bucket
///
/// Every batch gets its own key prefix, `{key_prefix}/{batch_ref}/`, holding
/// one object per attachment. Notices are small text objects under
/// `{key_prefix}/notices/`.
pub struct S3Host {
    client: S3Client,
    bucket: String,
    key_prefix: String,
    public_base_url: String,
}

impl S3Host {
    /// Create a new S3 host
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 attachment host initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            key_prefix: config.key_prefix.trim_end_matches('/').to_string(),
            public_base_url: public_base_url(config),
        })
    }

    fn batch_prefix(&self, batch_ref: &str) -> String {
        format!("{}/{}/", self.key_prefix, sanitize_path_component(batch_ref))
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }

    async fn put(&self, key: &str, body: ByteStream, content_type: &str) -> Result<(), HostError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| HostError::Request(format!("put {}: {}", key, e)))?;
        Ok(())
    }

    async fn delete_keys(&self, keys: Vec<String>) -> Result<(), HostError> {
        let objects = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| HostError::Request(e.to_string()))?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|e| HostError::Request(e.to_string()))?;

        let response = self
            .client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| HostError::Request(format!("delete objects: {}", e)))?;

        if let Some(failed) = response.errors().first() {
            return Err(HostError::Rejected {
                status: 500,
                message: format!(
                    "{} objects not deleted, first {}: {}",
                    response.errors().len(),
                    failed.key().unwrap_or_default(),
                    failed.message().unwrap_or_default()
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AttachmentHost for S3Host {
    #[instrument(skip(self, attachments), fields(count = attachments.len()))]
    async fn upload_batch(&self, attachments: Vec<Attachment>) -> Result<HostedBatch, HostError> {
        let batch_ref = Uuid::new_v4().to_string();
        let prefix = self.batch_prefix(&batch_ref);
        let mut written = Vec::with_capacity(attachments.len());
        let mut urls = Vec::with_capacity(attachments.len());

        for attachment in attachments {
            let key = format!("{}{}", prefix, sanitize_path_component(&attachment.name));
            let size_bytes = attachment.data.len();

            if let Err(e) = self
                .put(&key, ByteStream::from(attachment.data), "application/octet-stream")
                .await
            {
                // Leave nothing behind from a half-written batch
                if !written.is_empty() {
                    if let Err(cleanup) = self.delete_keys(written).await {
                        warn!(batch_ref = %batch_ref, error = %cleanup, "Failed to clean up partial batch");
                    }
                }
                return Err(e);
            }

            debug!(key = %key, size_bytes = size_bytes, "Attachment stored");
            urls.push(self.object_url(&key));
            written.push(key);
        }

        Ok(HostedBatch { batch_ref, urls })
    }

    #[instrument(skip(self))]
    async fn delete_batch(&self, batch_ref: &str) -> Result<(), HostError> {
        let prefix = self.batch_prefix(batch_ref);

        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&prefix)
            .send()
            .await
            .map_err(|e| HostError::Request(format!("list {}: {}", prefix, e)))?;

        let keys: Vec<String> = response
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(String::from))
            .collect();

        if keys.is_empty() {
            return Err(HostError::NotFound(batch_ref.to_string()));
        }

        self.delete_keys(keys).await?;
        debug!(batch_ref = %batch_ref, "Batch deleted from S3");
        Ok(())
    }

    async fn post_notice(&self, content: &str) -> Result<NoticeRef, HostError> {
        let key = format!("{}/notices/{}.txt", self.key_prefix, Uuid::new_v4());
        self.put(
            &key,
            ByteStream::from(content.as_bytes().to_vec()),
            "text/plain; charset=utf-8",
        )
        .await?;

        Ok(NoticeRef {
            channel_id: self.bucket.clone(),
            message_id: key,
        })
    }

    async fn delete_notice(&self, notice: &NoticeRef) -> Result<(), HostError> {
        self.client
            .delete_object()
            .bucket(&notice.channel_id)
            .key(&notice.message_id)
            .send()
            .await
            .map_err(|e| HostError::Request(format!("delete {}: {}", notice.message_id, e)))?;
        Ok(())
    }
}

fn public_base_url(config: &S3Config) -> String {
    match config.public_base_url {
        Some(ref url) => url.trim_end_matches('/').to_string(),
        None => match config.endpoint_url {
            Some(ref endpoint) if config.force_path_style => {
                format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket)
            }
            _ => format!("https://{}.s3.{}.amazonaws.com", config.bucket, config.region),
        },
    }
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect::<String>()
        .replace("..", "__")
}
