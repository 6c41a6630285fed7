/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Metrics collection for backup and restore operations
//!
//! Every recorded event updates the in-process [`BackupMetrics`] snapshot and
//! is also emitted through the `metrics` facade, so an installed exporter
//! (Prometheus or otherwise) sees the same counters.

use crate::{artifact::BackupTier, restore::RestoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::RwLock;

/// Shared handle to the metrics snapshot
pub type SharedMetrics = Arc<RwLock<BackupMetrics>>;

/// Backup and restore metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupMetrics {
    pub backup_stats: BackupStats,
    pub restore_stats: RestoreStats,
    pub retention_stats: RetentionStats,
}

/// Backup operation statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupStats {
    pub total_backups: u64,
    pub successful_backups: u64,
    pub failed_backups: u64,
    pub total_bytes_written: u64,
    pub average_backup_duration: f64,
    pub last_backup_time: Option<DateTime<Utc>>,
    pub backups_by_tier: BTreeMap<BackupTier, u64>,
    pub failures_by_tier: BTreeMap<BackupTier, u64>,
}

/// Restore operation statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreStats {
    pub total_restores: u64,
    pub successful_restores: u64,
    pub failed_restores: u64,
    pub dry_runs: u64,
    pub total_documents_restored: u64,
    pub average_restore_duration: f64,
    pub last_restore_time: Option<DateTime<Utc>>,
}

/// Retention cleanup statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionStats {
    pub cleanup_runs: u64,
    pub artifacts_deleted: u64,
    pub deleted_by_tier: BTreeMap<BackupTier, u64>,
    pub last_cleanup_time: Option<DateTime<Utc>>,
}

impl BackupMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new shared metrics handle
    pub fn shared() -> SharedMetrics {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a persisted artifact
    pub fn record_backup(&mut self, tier: BackupTier, size_bytes: u64, duration_seconds: f64) {
        let stats = &mut self.backup_stats;
        stats.total_backups += 1;
        stats.successful_backups += 1;
        stats.total_bytes_written += size_bytes;
        stats.average_backup_duration = running_average(
            stats.average_backup_duration,
            stats.successful_backups,
            duration_seconds,
        );
        stats.last_backup_time = Some(Utc::now());
        *stats.backups_by_tier.entry(tier).or_insert(0) += 1;

        metrics::counter!("backup_artifacts_created_total", "tier" => tier.as_str()).increment(1);
    }

    /// Record a backup that failed to export or persist
    pub fn record_backup_failure(&mut self, tier: BackupTier) {
        self.backup_stats.total_backups += 1;
        self.backup_stats.failed_backups += 1;
        *self.backup_stats.failures_by_tier.entry(tier).or_insert(0) += 1;

        metrics::counter!("backup_failures_total", "tier" => tier.as_str()).increment(1);
    }

    /// Record a restore operation, complete or partial
    pub fn record_restore(&mut self, result: &RestoreResult) {
        let stats = &mut self.restore_stats;
        stats.total_restores += 1;

        if result.is_complete() {
            stats.successful_restores += 1;
        } else {
            stats.failed_restores += 1;
        }
        if result.dry_run {
            stats.dry_runs += 1;
        }

        stats.total_documents_restored += result.documents_written as u64;
        stats.average_restore_duration = running_average(
            stats.average_restore_duration,
            stats.total_restores,
            result.duration_seconds,
        );
        stats.last_restore_time = Some(Utc::now());

        let outcome = if result.is_complete() { "success" } else { "failure" };
        metrics::counter!("backup_restores_total", "outcome" => outcome).increment(1);
    }

    /// Record a retention pass over one tier
    pub fn record_cleanup(&mut self, tier: BackupTier, deleted: usize) {
        let stats = &mut self.retention_stats;
        stats.cleanup_runs += 1;
        stats.artifacts_deleted += deleted as u64;
        stats.last_cleanup_time = Some(Utc::now());
        if deleted > 0 {
            *stats.deleted_by_tier.entry(tier).or_insert(0) += deleted as u64;
        }

        metrics::counter!("backup_artifacts_deleted_total", "tier" => tier.as_str())
            .increment(deleted as u64);
    }
}

fn running_average(previous: f64, count: u64, sample: f64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    (previous * (count - 1) as f64 + sample) / count as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_counters() {
        let mut metrics = BackupMetrics::new();
        metrics.record_backup(BackupTier::Daily, 100, 1.0);
        metrics.record_backup(BackupTier::Daily, 300, 3.0);
        metrics.record_backup_failure(BackupTier::Weekly);

        let stats = &metrics.backup_stats;
        assert_eq!(stats.total_backups, 3);
        assert_eq!(stats.successful_backups, 2);
        assert_eq!(stats.failed_backups, 1);
        assert_eq!(stats.total_bytes_written, 400);
        assert_eq!(stats.average_backup_duration, 2.0);
        assert_eq!(stats.backups_by_tier[&BackupTier::Daily], 2);
        assert_eq!(stats.failures_by_tier[&BackupTier::Weekly], 1);
    }

    #[test]
    fn test_restore_counters() {
        let mut metrics = BackupMetrics::new();
        metrics.record_restore(&RestoreResult {
            documents_written: 12,
            duration_seconds: 0.5,
            ..Default::default()
        });
        metrics.record_restore(&RestoreResult {
            dry_run: true,
            duration_seconds: 1.5,
            ..Default::default()
        });

        let stats = &metrics.restore_stats;
        assert_eq!(stats.total_restores, 2);
        assert_eq!(stats.successful_restores, 2);
        assert_eq!(stats.dry_runs, 1);
        assert_eq!(stats.total_documents_restored, 12);
        assert_eq!(stats.average_restore_duration, 1.0);
    }

    #[test]
    fn test_cleanup_counters() {
        let mut metrics = BackupMetrics::new();
        metrics.record_cleanup(BackupTier::Daily, 0);
        metrics.record_cleanup(BackupTier::Daily, 2);

        assert_eq!(metrics.retention_stats.cleanup_runs, 2);
        assert_eq!(metrics.retention_stats.artifacts_deleted, 2);
        assert_eq!(metrics.retention_stats.deleted_by_tier[&BackupTier::Daily], 2);
    }
}
