/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! # Backup and Restore Engine
//!
//! Point-in-time snapshots of the waste-management platform's two live
//! stores (a collection-of-documents store and a single-root tree store),
//! including:
//!
//! - Cross-store export into one self-contained JSON artifact
//! - Tiered on-disk repository with optional compression
//! - Structural validation that never writes
//! - Batched restore with a non-mutating dry run
//! - Cron-driven retention scheduling per tier
//! - Best-effort off-site mirroring

pub mod artifact;
pub mod backup;
pub mod compression;
pub mod config;
pub mod error;
pub mod metrics;
pub mod mirror;
pub mod restore;
pub mod scheduler;
pub mod source;
pub mod storage;
pub mod validate;

pub use crate::metrics::BackupMetrics;
pub use artifact::{BackupArtifact, BackupTier, RetentionWindow};
pub use backup::SnapshotExporter;
pub use compression::{CompressionConfig, CompressionType};
pub use config::BackupEngineConfig;
pub use error::{BackupError, RestoreError, Result};
pub use mirror::{DirectoryMirror, MirrorConfig, RemoteMirror};
pub use restore::{RestoreConfig, RestoreEngine, RestoreOptions, RestoreResult};
pub use scheduler::{PartialScheduleConfig, RetentionScheduler, ScheduleConfig, SchedulerStatus};
pub use source::{DocumentStore, SourceStores, TreeStore};
pub use storage::{ArtifactSummary, BackupRepository, PersistResult, RepositoryStats};
pub use validate::{BackupValidator, ValidationReport};

use crate::{
    artifact::ArtifactMetadata,
    metrics::SharedMetrics,
    scheduler::{ScheduledBackupResult, TestBackupReport},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc};
use tracing::{error, info, warn};

/// One page of a backup listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupListing {
    /// Matching backups before paging
    pub total: usize,
    pub backups: Vec<ArtifactSummary>,
}

/// Decoded view of a single stored backup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDetails {
    pub metadata: ArtifactMetadata,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub collections: Vec<String>,
    pub document_count: usize,
    pub has_tree_store: bool,
}

/// Stored bytes of a backup, ready to hand to a client
#[derive(Debug, Clone)]
pub struct BackupDownload {
    pub backup_id: String,
    pub file_name: String,
    pub compression: CompressionType,
    pub content: Vec<u8>,
}

/// Main backup and restore service
#[derive(Debug, Clone)]
pub struct BackupService {
    inner: Arc<BackupServiceInner>,
}

#[derive(Debug)]
struct BackupServiceInner {
    config: BackupEngineConfig,
    repository: Arc<BackupRepository>,
    exporter: SnapshotExporter,
    validator: BackupValidator,
    restore_engine: RestoreEngine,
    scheduler: RetentionScheduler,
    metrics: SharedMetrics,
}

impl BackupService {
    /// Create a new backup service over the given stores. A directory mirror
    /// is attached when the configuration names one.
    pub async fn new(config: BackupEngineConfig, stores: SourceStores) -> Result<Self> {
        let mirror = config
            .mirror
            .as_ref()
            .map(|mirror| Arc::new(DirectoryMirror::new(mirror)) as Arc<dyn RemoteMirror>);
        Self::with_mirror(config, stores, mirror).await
    }

    /// Create a new backup service with a custom mirror
    pub async fn with_mirror(
        config: BackupEngineConfig,
        stores: SourceStores,
        mirror: Option<Arc<dyn RemoteMirror>>,
    ) -> Result<Self> {
        info!("Initializing backup service");

        let repository = Arc::new(BackupRepository::open(&config.repository, mirror).await?);
        let exporter = SnapshotExporter::new(stores.clone());
        let validator = BackupValidator::new(repository.clone());
        let restore_engine = RestoreEngine::new(repository.clone(), stores, &config.restore);
        let metrics = BackupMetrics::shared();
        let scheduler = RetentionScheduler::new(
            &config.schedule,
            exporter.clone(),
            repository.clone(),
            validator.clone(),
            metrics.clone(),
        )?;

        Ok(Self {
            inner: Arc::new(BackupServiceInner {
                config,
                repository,
                exporter,
                validator,
                restore_engine,
                scheduler,
                metrics,
            }),
        })
    }

    pub fn config(&self) -> &BackupEngineConfig {
        &self.inner.config
    }

    pub fn repository(&self) -> &Arc<BackupRepository> {
        &self.inner.repository
    }

    /// Start the retention scheduler
    pub async fn start(&self) -> Result<()> {
        info!("Starting backup service");
        self.inner.scheduler.start().await
    }

    /// Stop the scheduler and wait for in-flight scheduled backups
    pub async fn shutdown(&self) {
        info!("Shutting down backup service");
        self.inner.scheduler.shutdown().await;
    }

    /// Export and persist a backup now. No retention pass follows.
    pub async fn create(&self, tier: BackupTier) -> Result<PersistResult> {
        info!("Creating {} backup", tier);
        let start_time = std::time::Instant::now();

        let outcome = async {
            let mut artifact = self.inner.exporter.export(tier).await?;
            self.inner.repository.persist(&mut artifact).await
        }
        .await;

        let mut metrics = self.inner.metrics.write().await;
        match &outcome {
            Ok(persisted) => metrics.record_backup(
                tier,
                persisted.size_bytes,
                start_time.elapsed().as_secs_f64(),
            ),
            Err(e) => {
                error!("Failed to create {} backup: {}", tier, e);
                metrics.record_backup_failure(tier);
            }
        }
        outcome
    }

    /// List backups newest first, optionally restricted to one tier
    pub async fn list(
        &self,
        tier: Option<BackupTier>,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<BackupListing> {
        let backups = match tier {
            Some(tier) => self.inner.repository.list_tier(tier).await?,
            None => self.inner.repository.list().await?,
        };

        let total = backups.len();
        let backups = backups
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect();

        Ok(BackupListing { total, backups })
    }

    /// Decode a backup and describe its contents
    pub async fn get_details(&self, backup_id: &str) -> Result<Option<BackupDetails>> {
        let Some(path) = self.inner.repository.find(backup_id).await? else {
            return Ok(None);
        };
        let Some(artifact) = self.inner.repository.load(backup_id).await? else {
            return Ok(None);
        };

        Ok(Some(BackupDetails {
            collections: artifact
                .document_store
                .as_ref()
                .map(|dataset| dataset.keys().cloned().collect())
                .unwrap_or_default(),
            document_count: artifact.document_count(),
            has_tree_store: artifact.tree_store.is_some(),
            size_bytes: artifact.size_bytes.unwrap_or_default(),
            metadata: artifact.metadata,
            path,
        }))
    }

    /// Run the validator against a stored backup
    pub async fn validate(&self, backup_id: &str) -> ValidationReport {
        self.inner.validator.validate(backup_id).await
    }

    /// Restore a backup into the live stores.
    ///
    /// Depending on [`RestoreConfig`], the artifact is validated first and the
    /// current state is captured into the `pre-restore` tier before anything
    /// is overwritten.
    pub async fn restore(
        &self,
        backup_id: &str,
        options: RestoreOptions,
    ) -> std::result::Result<RestoreResult, RestoreError> {
        let config = &self.inner.config.restore;

        if self.inner.repository.find(backup_id).await?.is_none() {
            return Err(RestoreError::ArtifactUnavailable {
                id: backup_id.to_string(),
                reason: "backup not found".to_string(),
            });
        }

        if config.verify_before_restore {
            let report = self.inner.validator.validate(backup_id).await;
            if !report.valid {
                return Err(RestoreError::InvalidArtifact {
                    id: backup_id.to_string(),
                    reason: report.reason.unwrap_or_default(),
                });
            }
        }

        if config.create_restore_point && !options.dry_run {
            let restore_point = self.create(BackupTier::PreRestore).await?;
            info!(
                "Captured restore point {} before restoring {}",
                restore_point.backup_id, backup_id
            );
        }

        let outcome = self.inner.restore_engine.restore(backup_id, options).await;
        match &outcome {
            Ok(result) => self.inner.metrics.write().await.record_restore(result),
            Err(RestoreError::StoreFailed { outcome, .. }) => {
                self.inner.metrics.write().await.record_restore(outcome)
            }
            Err(e) => warn!("Restore of {} did not start: {}", backup_id, e),
        }
        outcome
    }

    /// Delete a backup. Returns whether anything was removed.
    pub async fn delete(&self, backup_id: &str) -> Result<bool> {
        let removed = self.inner.repository.delete(backup_id).await?;
        if !removed {
            warn!("Backup {} not found, nothing deleted", backup_id);
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<RepositoryStats> {
        self.inner.repository.stats().await
    }

    /// Delete backups of every tier older than `retention_days` days
    pub async fn cleanup(&self, retention_days: u32) -> Result<usize> {
        let window = RetentionWindow::Days(retention_days);
        let mut total = 0;

        for tier in BackupTier::ALL {
            let deleted = self.inner.repository.delete_expired(tier, window).await?;
            self.inner.metrics.write().await.record_cleanup(tier, deleted);
            total += deleted;
        }

        info!(
            "Cleanup removed {} backups older than {} days",
            total, retention_days
        );
        Ok(total)
    }

    pub async fn scheduler_status(&self) -> SchedulerStatus {
        self.inner.scheduler.status().await
    }

    pub async fn update_schedule(
        &self,
        tier: BackupTier,
        changes: PartialScheduleConfig,
    ) -> Result<ScheduleConfig> {
        self.inner.scheduler.update_schedule(tier, changes).await
    }

    /// Run a tier's scheduled pipeline (backup plus retention) immediately
    pub async fn trigger(&self, tier: BackupTier) -> ScheduledBackupResult {
        self.inner.scheduler.trigger_manual(tier).await
    }

    pub async fn test_backup(&self) -> Result<TestBackupReport> {
        self.inner.scheduler.test_backup().await
    }

    /// Stored (possibly compressed) bytes of a backup
    pub async fn download(&self, backup_id: &str) -> Result<Option<BackupDownload>> {
        let Some((path, content)) = self.inner.repository.read_raw(backup_id).await? else {
            return Ok(None);
        };

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("{}.json", backup_id));
        let (stored_id, compression) = CompressionType::parse_file_name(&file_name)
            .map(|(id, compression)| (id.to_string(), compression))
            .unwrap_or_else(|| (backup_id.to_string(), CompressionType::None));

        Ok(Some(BackupDownload {
            backup_id: stored_id,
            file_name,
            compression,
            content,
        }))
    }

    /// Get backup metrics
    pub async fn metrics(&self) -> BackupMetrics {
        self.inner.metrics.read().await.clone()
    }
}
