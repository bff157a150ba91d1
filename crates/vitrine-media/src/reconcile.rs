//! Anti-entropy reconciler for ledger/object-store consistency.
//!
//! The ledger and the object store are not updated atomically: a blob
//! upload can fail after its rows committed (upload path) or objects can
//! outlive their rows (delete path's best-effort cleanup). The reconciler
//! detects those windows. It is explicitly an **anti-entropy** tool: bucket
//! listing happens here for verification and repair only; the normal read
//! path stays ledger-driven.
//!
//! Issue classes:
//!
//! - a ledger image row whose original blob is missing
//! - a rendition row whose blob is missing
//! - an image with no rendition rows at all (points at the dead-letter set)
//! - an object under `images/` no row references (repairable by deletion)

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vitrine_core::{MediaPaths, StorageBackend};

use crate::error::Result;
use crate::ledger::LedgerStore;

/// Report from a reconciliation check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    /// When the check was performed.
    pub checked_at: DateTime<Utc>,
    /// Image rows examined.
    pub image_count: usize,
    /// Rendition rows examined.
    pub rendition_count: usize,
    /// Objects found under the images prefix.
    pub object_count: usize,
    /// Issues found.
    pub issues: Vec<ReconciliationIssue>,
}

impl ReconciliationReport {
    /// Returns true if any issues were found.
    #[must_use]
    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }

    /// Returns issues of a specific type.
    #[must_use]
    pub fn issues_of_type(&self, issue_type: IssueType) -> Vec<&ReconciliationIssue> {
        self.issues
            .iter()
            .filter(|i| i.issue_type == issue_type)
            .collect()
    }
}

/// A specific reconciliation issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationIssue {
    /// Type of issue.
    pub issue_type: IssueType,
    /// Affected object path (or the would-be path for missing blobs).
    pub path: String,
    /// Human-readable description.
    pub description: String,
    /// Whether [`Reconciler::repair`] can fix this automatically.
    pub repairable: bool,
}

/// Type of reconciliation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    /// An image row exists but its original blob does not.
    MissingOriginalBlob,
    /// A rendition row exists but its blob does not.
    MissingRenditionBlob,
    /// An image has no rendition rows (optimization never completed).
    MissingRenditions,
    /// An object exists that no ledger row references.
    OrphanedObject,
}

/// Verifies and repairs ledger/object-store consistency.
pub struct Reconciler<S: StorageBackend + ?Sized> {
    ledger: Arc<dyn LedgerStore>,
    storage: Arc<S>,
}

impl<S: StorageBackend + ?Sized> Reconciler<S> {
    /// Creates a reconciler.
    pub fn new(ledger: Arc<dyn LedgerStore>, storage: Arc<S>) -> Self {
        Self { ledger, storage }
    }

    /// Runs a full consistency check. Read-only.
    ///
    /// # Errors
    ///
    /// Propagates ledger and storage failures.
    pub async fn check(&self) -> Result<ReconciliationReport> {
        let mut issues = Vec::new();
        let mut referenced: HashSet<String> = HashSet::new();
        let mut rendition_count = 0;

        let images = self.ledger.all_images().await?;
        for (_model_id, image) in &images {
            let original = MediaPaths::original(image.id, image.mime.extension());
            if self.storage.head(&original).await?.is_none() {
                issues.push(ReconciliationIssue {
                    issue_type: IssueType::MissingOriginalBlob,
                    path: original.clone(),
                    description: format!(
                        "image {} has a ledger row but no original object",
                        image.id
                    ),
                    repairable: false,
                });
            }
            referenced.insert(original);

            let renditions = self.ledger.renditions(image.id).await?;
            if renditions.is_empty() {
                issues.push(ReconciliationIssue {
                    issue_type: IssueType::MissingRenditions,
                    path: MediaPaths::optimized_dir(image.id),
                    description: format!(
                        "image {} has no renditions; check the dead-letter set",
                        image.id
                    ),
                    repairable: false,
                });
            }
            for rendition in &renditions {
                rendition_count += 1;
                let path = MediaPaths::rendition(
                    image.id,
                    rendition.width,
                    rendition.mime.extension(),
                );
                if self.storage.head(&path).await?.is_none() {
                    issues.push(ReconciliationIssue {
                        issue_type: IssueType::MissingRenditionBlob,
                        path: path.clone(),
                        description: format!(
                            "rendition {} of image {} has a row but no object",
                            rendition.id, image.id
                        ),
                        repairable: false,
                    });
                }
                referenced.insert(path);
            }
        }

        let objects = self.storage.list(MediaPaths::IMAGES_PREFIX).await?;
        let object_count = objects.len();
        for object in objects {
            if !referenced.contains(&object.path) {
                issues.push(ReconciliationIssue {
                    issue_type: IssueType::OrphanedObject,
                    path: object.path.clone(),
                    description: "object is referenced by no ledger row".into(),
                    repairable: true,
                });
            }
        }

        Ok(ReconciliationReport {
            checked_at: Utc::now(),
            image_count: images.len(),
            rendition_count,
            object_count,
            issues,
        })
    }

    /// Deletes the repairable issues from a report (orphaned objects).
    ///
    /// Returns the number of objects deleted. Missing-blob issues are not
    /// auto-repairable: they need the original bytes, which only exist in
    /// a dead-lettered job payload or a client re-upload.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn repair(&self, report: &ReconciliationReport) -> Result<usize> {
        let mut deleted = 0;
        for issue in &report.issues {
            if issue.repairable {
                self.storage.delete(&issue.path).await?;
                deleted += 1;
                tracing::info!(path = %issue.path, "deleted orphaned object");
            }
        }
        Ok(deleted)
    }
}
