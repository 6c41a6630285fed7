/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Restore management module
//!
//! The document store and the tree store are restored independently. Both
//! phases are attempted even when the other fails, and each failure is
//! reported on its own. Nothing is rolled back: document batches that were
//! committed before a failure stay committed.

use crate::{
    artifact::{BackupArtifact, DocumentDataset},
    error::{RestoreError, StoreFailure},
    source::{DocumentStore, DocumentWrite, SourceStores, StoreKind, DEFAULT_MAX_BATCH_SIZE},
    storage::BackupRepository,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Restore configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Run the validator before replaying an artifact
    pub verify_before_restore: bool,
    /// Snapshot the live stores into the `pre-restore` tier before writing
    pub create_restore_point: bool,
    /// Upper bound on writes per document-store commit
    pub max_batch_size: usize,
}

/// Options for a restore operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreOptions {
    pub restore_document_store: bool,
    pub restore_tree_store: bool,
    pub dry_run: bool,
}

/// Result of a restore operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub backup_id: String,
    /// Whether document writes were actually committed
    pub restored_document_store: bool,
    /// Whether the tree root was actually overwritten
    pub restored_tree_store: bool,
    pub dry_run: bool,
    /// Documents in the artifact selected for replay
    pub documents_planned: usize,
    /// Documents committed to the store
    pub documents_written: usize,
    pub batches_committed: usize,
    /// Tree overwrite skipped because of `dry_run`
    pub tree_store_simulated: bool,
    pub duration_seconds: f64,
    pub failures: Vec<StoreFailure>,
}

impl RestoreResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Accumulates document writes and commits them in bounded batches
struct WriteBatch<'a> {
    store: &'a dyn DocumentStore,
    limit: usize,
    pending: Vec<DocumentWrite>,
    written: usize,
    committed: usize,
}

impl<'a> WriteBatch<'a> {
    fn new(store: &'a dyn DocumentStore, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            store,
            limit,
            pending: Vec::with_capacity(limit),
            written: 0,
            committed: 0,
        }
    }

    async fn push(&mut self, write: DocumentWrite) -> anyhow::Result<()> {
        self.pending.push(write);
        if self.pending.len() >= self.limit {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let writes = std::mem::replace(&mut self.pending, Vec::with_capacity(self.limit));
        let count = writes.len();
        self.store.commit_batch(writes).await?;
        self.written += count;
        self.committed += 1;
        debug!("Committed restore batch {} ({} writes)", self.committed, count);
        Ok(())
    }
}

/// Replays stored artifacts into the live stores
#[derive(Debug, Clone)]
pub struct RestoreEngine {
    repository: Arc<BackupRepository>,
    stores: SourceStores,
    config: RestoreConfig,
}

impl RestoreEngine {
    pub fn new(
        repository: Arc<BackupRepository>,
        stores: SourceStores,
        config: &RestoreConfig,
    ) -> Self {
        Self {
            repository,
            stores,
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &RestoreConfig {
        &self.config
    }

    /// Locate, decode and replay an artifact
    pub async fn restore(
        &self,
        backup_id: &str,
        options: RestoreOptions,
    ) -> Result<RestoreResult, RestoreError> {
        let artifact = match self.repository.load(backup_id).await {
            Ok(Some(artifact)) => artifact,
            Ok(None) => {
                return Err(RestoreError::ArtifactUnavailable {
                    id: backup_id.to_string(),
                    reason: "backup not found".to_string(),
                })
            }
            Err(e) => {
                return Err(RestoreError::ArtifactUnavailable {
                    id: backup_id.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        self.restore_artifact(&artifact, options).await
    }

    /// Replay an already decoded artifact
    pub async fn restore_artifact(
        &self,
        artifact: &BackupArtifact,
        options: RestoreOptions,
    ) -> Result<RestoreResult, RestoreError> {
        let start_time = std::time::Instant::now();
        if options.dry_run {
            info!("Dry-run restore of backup {}", artifact.id());
        } else {
            warn!("Starting restore operation for backup: {}", artifact.id());
        }

        // Dry runs only read, so they can share the stores with exports
        let _shared;
        let _exclusive;
        if options.dry_run {
            _shared = self.stores.lease.shared().await;
        } else {
            _exclusive = self.stores.lease.exclusive().await;
        }

        let mut result = RestoreResult {
            backup_id: artifact.id().to_string(),
            dry_run: options.dry_run,
            ..Default::default()
        };

        if options.restore_document_store {
            match &artifact.document_store {
                Some(dataset) => self.restore_documents(dataset, options.dry_run, &mut result).await,
                None => debug!("Backup {} has no document store data", artifact.id()),
            }
        }

        if options.restore_tree_store {
            match &artifact.tree_store {
                Some(tree) => self.restore_tree(tree, options.dry_run, &mut result).await,
                None => debug!("Backup {} has no tree store data", artifact.id()),
            }
        }

        result.duration_seconds = start_time.elapsed().as_secs_f64();

        if result.is_complete() {
            info!(
                "Restore of {} finished: {} documents in {} batches, tree {}",
                result.backup_id,
                result.documents_written,
                result.batches_committed,
                if result.restored_tree_store {
                    "replaced"
                } else if result.tree_store_simulated {
                    "simulated"
                } else {
                    "untouched"
                }
            );
            Ok(result)
        } else {
            Err(RestoreError::StoreFailed {
                failures: result.failures.clone(),
                outcome: Box::new(result),
            })
        }
    }

    async fn restore_documents(
        &self,
        dataset: &DocumentDataset,
        dry_run: bool,
        result: &mut RestoreResult,
    ) {
        result.documents_planned = dataset.values().map(|c| c.len()).sum();
        if dry_run {
            debug!(
                "Dry run: would write {} documents across {} collections",
                result.documents_planned,
                dataset.len()
            );
            return;
        }

        let store = self.stores.documents.as_ref();
        let limit = self
            .config
            .max_batch_size
            .min(store.max_batch_size());
        let mut batch = WriteBatch::new(store, limit);

        let mut outcome = Ok(());
        'collections: for (collection, documents) in dataset {
            for (id, record) in documents {
                let write = DocumentWrite {
                    collection: collection.clone(),
                    id: id.clone(),
                    fields: record.fields.clone(),
                };
                if let Err(e) = batch.push(write).await {
                    outcome = Err(e);
                    break 'collections;
                }
            }
        }
        if outcome.is_ok() {
            outcome = batch.flush().await;
        }

        result.documents_written = batch.written;
        result.batches_committed = batch.committed;
        result.restored_document_store = batch.committed > 0;

        if let Err(e) = outcome {
            error!(
                "Document store restore aborted after {} of {} documents: {:#}",
                batch.written, result.documents_planned, e
            );
            result.failures.push(StoreFailure {
                store: StoreKind::DocumentStore,
                cause: format!("{:#}", e),
            });
        }
    }

    async fn restore_tree(&self, tree: &Value, dry_run: bool, result: &mut RestoreResult) {
        if dry_run {
            result.tree_store_simulated = true;
            return;
        }

        match self.stores.tree.write_root(tree.clone()).await {
            Ok(()) => result.restored_tree_store = true,
            Err(e) => {
                error!("Tree store restore failed: {:#}", e);
                result.failures.push(StoreFailure {
                    store: StoreKind::TreeStore,
                    cause: format!("{:#}", e),
                });
            }
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            verify_before_restore: true,
            create_restore_point: true,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            restore_document_store: true,
            restore_tree_store: true,
            dry_run: false,
        }
    }
}
