//! Removal of a file and everything it left on the attachment host.
//!
//! Remote deletes are best effort: each failure is recorded in the
//! [`DeletionReport`] and the others carry on. The registry row is removed
//! whatever happens remotely.

use crate::attachment_host::{AttachmentHost, HostError};
use crate::part_registry::{FileSort, PartRegistry};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Errors that prevent a deletion from being attempted at all
#[derive(Error, Debug)]
pub enum DeletionError {
    #[error("File {0} not found")]
    NotFound(String),

    #[error("File {file_id} is not owned by {owner_id}")]
    NotOwner { file_id: String, owner_id: String },

    #[error("Registry error: {0}")]
    Registry(#[from] anyhow::Error),
}

/// Something a deletion has to remove
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    Notice,
    Batch { batch_ref: String },
    RegistryRow,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeletionFailure {
    pub resource: Resource,
    pub error: String,
}

/// Outcome of deleting one file
#[derive(Debug, Clone, Serialize)]
pub struct DeletionReport {
    pub file_id: String,
    /// Remote delete calls issued
    pub attempted: usize,
    pub failures: Vec<DeletionFailure>,
}

impl DeletionReport {
    pub fn encountered_error(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Outcome of deleting every file of an owner
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkDeletionReport {
    pub deleted: usize,
    /// Files whose deletion reported failures
    pub with_errors: Vec<String>,
}

pub struct DeletionCoordinator {
    host: Arc<dyn AttachmentHost>,
    registry: Arc<PartRegistry>,
}

impl DeletionCoordinator {
    pub fn new(host: Arc<dyn AttachmentHost>, registry: Arc<PartRegistry>) -> Self {
        Self { host, registry }
    }

    /// Delete a file's notice, its batches and its registry row
    #[instrument(skip(self))]
    pub async fn delete_file(&self, file_id: &str) -> Result<DeletionReport, DeletionError> {
        let file = self
            .registry
            .file(file_id)
            .await?
            .ok_or_else(|| DeletionError::NotFound(file_id.to_string()))?;

        let mut batch_refs: Vec<String> = Vec::new();
        for part in self.registry.parts(file_id).await? {
            if !batch_refs.contains(&part.batch_ref) {
                batch_refs.push(part.batch_ref);
            }
        }

        let mut failures = Vec::new();
        let mut deletes: Vec<BoxFuture<'static, (Resource, Result<(), HostError>)>> =
            Vec::with_capacity(batch_refs.len() + 1);

        match file.notice() {
            Some(notice) => {
                let host = self.host.clone();
                deletes.push(
                    async move { (Resource::Notice, host.delete_notice(&notice).await) }.boxed(),
                );
            }
            None => failures.push(DeletionFailure {
                resource: Resource::Notice,
                error: "No upload notice recorded".to_string(),
            }),
        }

        for batch_ref in batch_refs {
            let host = self.host.clone();
            deletes.push(
                async move {
                    let result = host.delete_batch(&batch_ref).await;
                    (Resource::Batch { batch_ref }, result)
                }
                .boxed(),
            );
        }

        let attempted = deletes.len();
        let (results, row) = tokio::join!(join_all(deletes), self.registry.delete_file(file_id));

        for (resource, result) in results {
            if let Err(e) = result {
                warn!(resource = ?resource, error = %e, "Remote delete failed");
                failures.push(DeletionFailure {
                    resource,
                    error: e.to_string(),
                });
            }
        }
        if let Err(e) = row {
            warn!(error = %e, "Failed to delete registry row");
            failures.push(DeletionFailure {
                resource: Resource::RegistryRow,
                error: format!("{:#}", e),
            });
        }

        let report = DeletionReport {
            file_id: file_id.to_string(),
            attempted,
            failures,
        };

        if report.encountered_error() {
            metrics::counter!("splitter.deletions.with_errors").increment(1);
        } else {
            metrics::counter!("splitter.deletions.completed").increment(1);
        }
        info!(
            attempted = attempted,
            failures = report.failures.len(),
            "File deleted"
        );

        Ok(report)
    }

    /// Delete a file after checking that `owner_id` owns it
    pub async fn delete_owned(&self, file_id: &str, owner_id: &str) -> Result<DeletionReport, DeletionError> {
        let metadata = self
            .registry
            .metadata(file_id)
            .await?
            .ok_or_else(|| DeletionError::NotFound(file_id.to_string()))?;

        if metadata.owner_id != owner_id {
            return Err(DeletionError::NotOwner {
                file_id: file_id.to_string(),
                owner_id: owner_id.to_string(),
            });
        }

        self.delete_file(file_id).await
    }

    /// Delete every file owned by `owner_id`
    #[instrument(skip(self))]
    pub async fn delete_all_owned(&self, owner_id: &str) -> Result<BulkDeletionReport, DeletionError> {
        let files = self.registry.files_by_owner(owner_id, FileSort::Date).await?;
        let mut bulk = BulkDeletionReport::default();

        for file in files {
            match self.delete_file(&file.id).await {
                Ok(report) => {
                    bulk.deleted += 1;
                    if report.encountered_error() {
                        bulk.with_errors.push(report.file_id);
                    }
                }
                // Removed concurrently
                Err(DeletionError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        info!(
            deleted = bulk.deleted,
            with_errors = bulk.with_errors.len(),
            "Owner files deleted"
        );
        Ok(bulk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment_host::{MemoryHost, MockAttachmentHost, NoticeRef};
    use crate::part_registry::NewPart;

    async fn registry() -> Arc<PartRegistry> {
        Arc::new(PartRegistry::in_memory().await.unwrap())
    }

    /// File with `parts` parts spread over the given batch refs, plus a notice
    async fn seed(registry: &PartRegistry, file_id: &str, owner: &str, batches: &[(&str, usize)]) {
        registry
            .open_upload(file_id, owner, &format!("tok-{}", file_id), 0)
            .await
            .unwrap();
        let mut index = 0;
        for (batch_ref, count) in batches {
            let parts: Vec<NewPart> = (0..*count)
                .map(|_| {
                    index += 1;
                    NewPart {
                        part_index: index,
                        url: format!("memory://{}/{}", batch_ref, index),
                        size_bytes: 1,
                    }
                })
                .collect();
            registry.add_parts(file_id, batch_ref, &parts).await.unwrap();
        }
        registry
            .set_upload_info(
                file_id,
                &NoticeRef {
                    channel_id: "chan".to_string(),
                    message_id: format!("notice-{}", file_id),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_one_attempt_per_batch_plus_notice() {
        let registry = registry().await;
        seed(&registry, "f1", "owner", &[("b1", 2), ("b2", 1)]).await;

        let mut host = MockAttachmentHost::new();
        host.expect_delete_notice().times(1).returning(|_| Ok(()));
        host.expect_delete_batch().times(2).returning(|_| Ok(()));

        let coordinator = DeletionCoordinator::new(Arc::new(host), registry.clone());
        let report = coordinator.delete_file("f1").await.unwrap();

        assert_eq!(report.attempted, 3);
        assert!(!report.encountered_error());
        assert!(registry.file("f1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remote_failures_still_remove_row() {
        let registry = registry().await;
        seed(&registry, "f1", "owner", &[("b1", 1), ("b2", 1), ("b3", 1)]).await;

        let mut host = MockAttachmentHost::new();
        host.expect_delete_notice().times(1).returning(|_| {
            Err(HostError::Rejected {
                status: 403,
                message: "missing permissions".to_string(),
            })
        });
        host.expect_delete_batch().times(3).returning(|batch_ref| {
            if batch_ref.starts_with("b2") {
                Err(HostError::Request("connection reset".to_string()))
            } else {
                Ok(())
            }
        });

        let coordinator = DeletionCoordinator::new(Arc::new(host), registry.clone());
        let report = coordinator.delete_file("f1").await.unwrap();

        assert_eq!(report.attempted, 4);
        assert!(report.encountered_error());
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().any(|f| f.resource == Resource::Notice));
        assert!(report.failures.iter().any(|f| f.resource
            == Resource::Batch {
                batch_ref: "b2".to_string()
            }));
        assert!(registry.file("f1").await.unwrap().is_none());
        assert!(registry.parts("f1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_notice_is_reported() {
        let registry = registry().await;
        registry.open_upload("f1", "owner", "tok", 0).await.unwrap();

        let mut host = MockAttachmentHost::new();
        host.expect_delete_notice().never();
        host.expect_delete_batch().never();

        let coordinator = DeletionCoordinator::new(Arc::new(host), registry.clone());
        let report = coordinator.delete_file("f1").await.unwrap();

        assert_eq!(report.attempted, 0);
        assert_eq!(report.failures[0].resource, Resource::Notice);
        assert!(registry.file("f1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_file_is_a_hard_error() {
        let coordinator = DeletionCoordinator::new(Arc::new(MemoryHost::new()), registry().await);
        assert!(matches!(
            coordinator.delete_file("ghost").await,
            Err(DeletionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_owned_checks_owner() {
        let registry = registry().await;
        seed(&registry, "f1", "alice", &[("b1", 1)]).await;
        let coordinator = DeletionCoordinator::new(Arc::new(MemoryHost::new()), registry.clone());

        assert!(matches!(
            coordinator.delete_owned("f1", "mallory").await,
            Err(DeletionError::NotOwner { .. })
        ));
        assert!(registry.file("f1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_all_owned() {
        let registry = registry().await;
        let host = Arc::new(MemoryHost::new());
        seed(&registry, "f1", "alice", &[("b1", 1)]).await;
        seed(&registry, "f2", "alice", &[("b2", 2)]).await;
        seed(&registry, "f3", "bob", &[("b3", 1)]).await;

        // Nothing was uploaded to the memory host, so every remote delete fails
        let coordinator = DeletionCoordinator::new(host.clone(), registry.clone());
        let bulk = coordinator.delete_all_owned("alice").await.unwrap();

        assert_eq!(bulk.deleted, 2);
        assert_eq!(bulk.with_errors.len(), 2);
        assert_eq!(host.delete_attempts(), 4);
        assert!(registry.files_by_owner("alice", FileSort::Date).await.unwrap().is_empty());
        assert_eq!(registry.files_by_owner("bob", FileSort::Date).await.unwrap().len(), 1);
    }
}
