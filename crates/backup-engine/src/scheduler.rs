/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Backup scheduling system
//!
//! Every enabled tier gets its own job: a tokio task sleeping until the next
//! cron occurrence, then exporting, persisting and applying the tier's
//! retention window. A job runs its backup inline, so a tier never overlaps
//! itself while different tiers run concurrently.

use crate::{
    artifact::BackupTier,
    backup::SnapshotExporter,
    error::{BackupError, Result},
    metrics::SharedMetrics,
    storage::{BackupRepository, PersistResult},
    validate::{BackupValidator, ValidationReport},
};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, str::FromStr, sync::Arc};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Retention applied to a tier scheduled without an explicit one
const DEFAULT_RETENTION: u32 = 30;

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub schedules: BTreeMap<BackupTier, ScheduleConfig>,
}

/// Schedule of a single tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub enabled: bool,
    /// Five-field cron, or six/seven fields with a leading seconds column
    pub cron_expression: String,
    /// Retention amount in the tier's unit, see [`BackupTier::retention_window`]
    pub retention: u32,
}

/// Fields to change in a tier's schedule; `None` keeps the current value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialScheduleConfig {
    pub enabled: Option<bool>,
    pub cron_expression: Option<String>,
    pub retention: Option<u32>,
}

impl PartialScheduleConfig {
    /// Merge over an existing schedule
    pub fn apply(&self, base: &ScheduleConfig) -> ScheduleConfig {
        ScheduleConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            cron_expression: self
                .cron_expression
                .clone()
                .unwrap_or_else(|| base.cron_expression.clone()),
            retention: self.retention.unwrap_or(base.retention),
        }
    }
}

/// Result of a scheduled or manually triggered backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledBackupResult {
    pub tier: BackupTier,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub backup_id: Option<String>,
    pub size_bytes: Option<u64>,
    pub error_message: Option<String>,
    /// Artifacts removed by the retention pass that followed
    pub deleted_expired: usize,
}

/// Per-tier status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierStatus {
    pub tier: BackupTier,
    pub config: ScheduleConfig,
    /// A job is currently registered for the tier
    pub active: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<ScheduledBackupResult>,
}

/// Scheduler status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub running: bool,
    pub tiers: Vec<TierStatus>,
}

/// Outcome of an end-to-end self test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestBackupReport {
    pub backup_id: String,
    pub size_bytes: u64,
    pub validation: ValidationReport,
    /// The disposable artifact was removed again
    pub deleted: bool,
    pub duration_seconds: f64,
}

impl TestBackupReport {
    pub fn passed(&self) -> bool {
        self.validation.valid
    }
}

/// Runtime handle of one tier's job
#[derive(Debug)]
struct ScheduleJob {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduleJob {
    async fn cancel_and_wait(self, tier: BackupTier) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!("Backup job for tier {} ended abnormally: {}", tier, e);
        }
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    running: bool,
    jobs: BTreeMap<BackupTier, ScheduleJob>,
}

/// Runs one backup job per enabled tier
#[derive(Debug, Clone)]
pub struct RetentionScheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Debug)]
struct SchedulerInner {
    enabled: bool,
    exporter: SnapshotExporter,
    repository: Arc<BackupRepository>,
    validator: BackupValidator,
    metrics: SharedMetrics,
    schedules: RwLock<BTreeMap<BackupTier, ScheduleConfig>>,
    state: Mutex<SchedulerState>,
    history: RwLock<BTreeMap<BackupTier, ScheduledBackupResult>>,
}

impl RetentionScheduler {
    /// Create a new backup scheduler. Every configured cron expression is
    /// validated up front.
    pub fn new(
        config: &SchedulerConfig,
        exporter: SnapshotExporter,
        repository: Arc<BackupRepository>,
        validator: BackupValidator,
        metrics: SharedMetrics,
    ) -> Result<Self> {
        for (tier, schedule) in &config.schedules {
            parse_cron(&schedule.cron_expression).map_err(|e| {
                BackupError::ConfigError(format!("Schedule for tier {}: {}", tier, e))
            })?;
        }

        info!(
            "Initializing backup scheduler with {} schedules",
            config.schedules.len()
        );

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                enabled: config.enabled,
                exporter,
                repository,
                validator,
                metrics,
                schedules: RwLock::new(config.schedules.clone()),
                state: Mutex::new(SchedulerState::default()),
                history: RwLock::new(BTreeMap::new()),
            }),
        })
    }

    /// Start one job per enabled tier. Calling it again while running is a no-op.
    pub async fn start(&self) -> Result<()> {
        if !self.inner.enabled {
            info!("Backup scheduler is disabled, not starting");
            return Ok(());
        }

        let mut state = self.inner.state.lock().await;
        if state.running {
            warn!("Backup scheduler is already running");
            return Ok(());
        }

        let schedules = self.inner.schedules.read().await.clone();
        let mut crons = Vec::new();
        for (tier, schedule) in schedules.iter().filter(|(_, s)| s.enabled) {
            crons.push((*tier, schedule, parse_cron(&schedule.cron_expression)?));
        }

        let mut jobs = BTreeMap::new();
        for (tier, schedule, cron) in crons {
            jobs.insert(tier, self.spawn_job(tier, cron));
            info!(
                "Scheduled {} backups with \"{}\" (retention {:?})",
                tier,
                schedule.cron_expression,
                tier.retention_window(schedule.retention)
            );
        }

        state.jobs = jobs;
        state.running = true;
        info!("Backup scheduler started with {} active jobs", state.jobs.len());
        Ok(())
    }

    /// Stop scheduling. Returns once backups already in progress have
    /// finished, so a following `start` never runs alongside them.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if !state.running {
            warn!("Backup scheduler is not running");
            return Ok(());
        }

        state.running = false;
        let jobs = std::mem::take(&mut state.jobs);
        for (tier, job) in jobs {
            job.cancel_and_wait(tier).await;
        }
        info!("Backup scheduler stopped");
        Ok(())
    }

    /// Stop scheduling and wait for in-flight backups to finish
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        state.running = false;

        let jobs = std::mem::take(&mut state.jobs);
        for (tier, job) in jobs {
            job.cancel_and_wait(tier).await;
        }
        debug!("Backup scheduler shut down");
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.running
    }

    /// Run a tier's backup and retention pass now, whether or not the
    /// scheduler is running
    pub async fn trigger_manual(&self, tier: BackupTier) -> ScheduledBackupResult {
        info!("Manually triggering {} backup", tier);
        self.inner.run_scheduled(tier).await
    }

    /// Merge changes into a tier's schedule and rebuild only that tier's job
    pub async fn update_schedule(
        &self,
        tier: BackupTier,
        changes: PartialScheduleConfig,
    ) -> Result<ScheduleConfig> {
        let mut state = self.inner.state.lock().await;

        let merged = match self.inner.schedules.read().await.get(&tier) {
            Some(current) => changes.apply(current),
            None => ScheduleConfig {
                enabled: changes.enabled.unwrap_or(true),
                cron_expression: changes.cron_expression.clone().ok_or_else(|| {
                    BackupError::ConfigError(format!(
                        "Tier {} has no schedule yet, a cron expression is required",
                        tier
                    ))
                })?,
                retention: changes.retention.unwrap_or(DEFAULT_RETENTION),
            },
        };
        let cron = parse_cron(&merged.cron_expression)?;

        if state.running {
            if let Some(job) = state.jobs.remove(&tier) {
                job.cancel_and_wait(tier).await;
            }
        }

        self.inner
            .schedules
            .write()
            .await
            .insert(tier, merged.clone());

        if state.running && merged.enabled {
            state.jobs.insert(tier, self.spawn_job(tier, cron));
        }

        info!(
            "Updated {} schedule: enabled={}, cron=\"{}\", retention={}",
            tier, merged.enabled, merged.cron_expression, merged.retention
        );
        Ok(merged)
    }

    /// Export into the `test` tier, validate the result, then remove it.
    ///
    /// An artifact that fails validation is kept for inspection.
    pub async fn test_backup(&self) -> Result<TestBackupReport> {
        let start_time = std::time::Instant::now();
        info!("Running backup self test");

        let mut artifact = self.inner.exporter.export(BackupTier::Test).await?;
        let persisted = self.inner.repository.persist(&mut artifact).await?;
        let validation = self.inner.validator.validate(&persisted.backup_id).await;

        let deleted = if validation.valid {
            self.inner.repository.delete(&persisted.backup_id).await?
        } else {
            warn!(
                "Backup self test produced an invalid artifact, keeping {} at {}",
                persisted.backup_id,
                persisted.path.display()
            );
            false
        };

        Ok(TestBackupReport {
            backup_id: persisted.backup_id,
            size_bytes: persisted.size_bytes,
            validation,
            deleted,
            duration_seconds: start_time.elapsed().as_secs_f64(),
        })
    }

    /// Current schedules, job states and last results
    pub async fn status(&self) -> SchedulerStatus {
        let state = self.inner.state.lock().await;
        let schedules = self.inner.schedules.read().await;
        let history = self.inner.history.read().await;

        let now = Utc::now();
        let tiers = schedules
            .iter()
            .map(|(tier, config)| {
                let active = state.jobs.contains_key(tier);
                let next_run = if active {
                    parse_cron(&config.cron_expression)
                        .ok()
                        .and_then(|cron| cron.after(&now).next())
                } else {
                    None
                };
                let last_result = history.get(tier).cloned();

                TierStatus {
                    tier: *tier,
                    config: config.clone(),
                    active,
                    next_run,
                    last_run: last_result.as_ref().map(|r| r.started_at),
                    last_result,
                }
            })
            .collect();

        SchedulerStatus {
            enabled: self.inner.enabled,
            running: state.running,
            tiers,
        }
    }

    pub async fn schedule(&self, tier: BackupTier) -> Option<ScheduleConfig> {
        self.inner.schedules.read().await.get(&tier).cloned()
    }

    fn spawn_job(&self, tier: BackupTier, cron: Schedule) -> ScheduleJob {
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_job(
            self.inner.clone(),
            tier,
            cron,
            token.clone(),
        ));
        ScheduleJob { token, handle }
    }
}

impl SchedulerInner {
    /// Backup, then on success apply the tier's retention window
    async fn run_scheduled(&self, tier: BackupTier) -> ScheduledBackupResult {
        let started_at = Utc::now();
        let start_time = std::time::Instant::now();

        let mut result = ScheduledBackupResult {
            tier,
            success: false,
            started_at,
            completed_at: started_at,
            backup_id: None,
            size_bytes: None,
            error_message: None,
            deleted_expired: 0,
        };

        match self.create_backup(tier).await {
            Ok(persisted) => {
                result.success = true;
                result.backup_id = Some(persisted.backup_id.clone());
                result.size_bytes = Some(persisted.size_bytes);
                self.metrics.write().await.record_backup(
                    tier,
                    persisted.size_bytes,
                    start_time.elapsed().as_secs_f64(),
                );

                let retention = self
                    .schedules
                    .read()
                    .await
                    .get(&tier)
                    .map(|schedule| schedule.retention);
                if let Some(retention) = retention {
                    let window = tier.retention_window(retention);
                    match self.repository.delete_expired(tier, window).await {
                        Ok(deleted) => {
                            result.deleted_expired = deleted;
                            self.metrics.write().await.record_cleanup(tier, deleted);
                        }
                        Err(e) => warn!("Retention cleanup for tier {} failed: {}", tier, e),
                    }
                }

                info!(
                    "Scheduled {} backup {} completed, {} expired backups removed",
                    tier, persisted.backup_id, result.deleted_expired
                );
            }
            Err(e) => {
                error!(
                    "Scheduled {} backup failed, skipping retention cleanup: {}",
                    tier, e
                );
                result.error_message = Some(e.to_string());
                self.metrics.write().await.record_backup_failure(tier);
            }
        }

        result.completed_at = Utc::now();
        self.history.write().await.insert(tier, result.clone());
        result
    }

    async fn create_backup(&self, tier: BackupTier) -> Result<PersistResult> {
        let mut artifact = self.exporter.export(tier).await?;
        self.repository.persist(&mut artifact).await
    }
}

async fn run_job(
    inner: Arc<SchedulerInner>,
    tier: BackupTier,
    cron: Schedule,
    token: CancellationToken,
) {
    loop {
        let now = Utc::now();
        let Some(next) = cron.after(&now).next() else {
            warn!("Schedule for tier {} has no upcoming occurrence", tier);
            break;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        debug!("Next {} backup at {}", tier, next);

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        inner.run_scheduled(tier).await;
    }
    debug!("Backup job for tier {} stopped", tier);
}

/// Bring a cron expression into the six/seven-field form of the `cron` crate.
///
/// Five-field expressions get a `0` seconds column, and their numeric
/// day-of-week values (0-7, Sunday being both 0 and 7) become day names.
pub fn normalize_cron(expression: &str) -> Result<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            day_names(fields[4])
        )),
        6 | 7 => Ok(fields.join(" ")),
        count => Err(BackupError::ScheduleError(format!(
            "\"{}\" has {} fields, expected 5, 6 or 7",
            expression, count
        ))),
    }
}

/// Parse a cron expression after normalizing it
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let normalized = normalize_cron(expression)?;
    Schedule::from_str(&normalized)
        .map_err(|e| BackupError::ScheduleError(format!("\"{}\": {}", expression, e)))
}

fn day_names(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let range = range
                .split('-')
                .map(|value| match value.parse::<usize>() {
                    Ok(day) if day <= 7 => DAY_NAMES[day % 7].to_string(),
                    _ => value.to_string(),
                })
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let schedules = [
            (BackupTier::Hourly, false, "0 * * * *", 24),
            (BackupTier::Daily, true, "0 2 * * *", 30),
            (BackupTier::Weekly, true, "0 3 * * 0", 12),
            (BackupTier::Monthly, true, "0 4 1 * *", 12),
        ]
        .into_iter()
        .map(|(tier, enabled, cron, retention)| {
            (
                tier,
                ScheduleConfig {
                    enabled,
                    cron_expression: cron.to_string(),
                    retention,
                },
            )
        })
        .collect();

        Self {
            enabled: true,
            schedules,
        }
    }
}
