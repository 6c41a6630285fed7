/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Configuration for the backup engine
//!
//! Loaded from a TOML file, then optionally overridden from the environment:
//!
//! | Variable                           | Field                             |
//! |------------------------------------|-----------------------------------|
//! | `BACKUP_ENGINE_ROOT`               | `repository.path`                 |
//! | `BACKUP_ENGINE_COMPRESSION`        | `repository.compression.default_type` |
//! | `BACKUP_ENGINE_MIRROR_DIR`         | `mirror.directory`                |
//! | `BACKUP_ENGINE_SCHEDULER_ENABLED`  | `schedule.enabled`                |

use crate::{
    error::{BackupError, Result},
    mirror::MirrorConfig,
    restore::RestoreConfig,
    scheduler::SchedulerConfig,
    storage::RepositoryConfig,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

pub const ENV_ROOT: &str = "BACKUP_ENGINE_ROOT";
pub const ENV_COMPRESSION: &str = "BACKUP_ENGINE_COMPRESSION";
pub const ENV_MIRROR_DIR: &str = "BACKUP_ENGINE_MIRROR_DIR";
pub const ENV_SCHEDULER_ENABLED: &str = "BACKUP_ENGINE_SCHEDULER_ENABLED";

/// Main configuration for the backup engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupEngineConfig {
    pub repository: RepositoryConfig,
    pub restore: RestoreConfig,
    pub schedule: SchedulerConfig,
    /// Off-site copies are disabled when absent
    pub mirror: Option<MirrorConfig>,
}

impl BackupEngineConfig {
    /// Create a default configuration with the repository at the specified path
    pub fn default_with_path(path: &Path) -> Self {
        Self {
            repository: RepositoryConfig {
                path: path.to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading backup configuration from file: {}", path.display());

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            BackupError::ConfigError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&content)?;

        info!("Loaded backup configuration from {}", path.display());
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| BackupError::ConfigError(format!("TOML parse error: {}", e)))
    }

    /// Apply `BACKUP_ENGINE_*` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(root) = lookup(ENV_ROOT) {
            debug!("Repository root overridden to {}", root);
            self.repository.path = root.into();
        }

        if let Some(compression) = lookup(ENV_COMPRESSION) {
            self.repository.compression.default_type = compression.parse()?;
        }

        if let Some(directory) = lookup(ENV_MIRROR_DIR) {
            self.mirror = if directory.trim().is_empty() {
                None
            } else {
                Some(MirrorConfig {
                    directory: directory.into(),
                })
            };
        }

        if let Some(enabled) = lookup(ENV_SCHEDULER_ENABLED) {
            self.schedule.enabled = enabled.trim().parse().map_err(|e| {
                BackupError::ConfigError(format!("Invalid {}: {}", ENV_SCHEDULER_ENABLED, e))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{artifact::BackupTier, compression::CompressionType};
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = BackupEngineConfig::default_with_path(Path::new("/tmp/backups"));
        assert_eq!(config.repository.path, Path::new("/tmp/backups"));
        assert!(config.restore.verify_before_restore);
        assert!(config.restore.create_restore_point);
        assert_eq!(config.restore.max_batch_size, 500);
        assert!(config.schedule.enabled);
        assert_eq!(config.schedule.schedules.len(), 4);
        assert!(config.mirror.is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config = BackupEngineConfig::from_toml(
            r#"
            [repository]
            path = "/srv/backups"

            [repository.compression]
            default_type = "zstd"

            [restore]
            max_batch_size = 100

            [schedule.schedules.daily]
            enabled = true
            cron_expression = "30 1 * * *"
            retention = 14

            [mirror]
            directory = "/mnt/offsite"
            "#,
        )
        .unwrap();

        assert_eq!(config.repository.path, Path::new("/srv/backups"));
        assert!(config.repository.create_directories);
        assert_eq!(config.repository.compression.default_type, CompressionType::Zstd);
        assert_eq!(config.restore.max_batch_size, 100);
        assert!(config.restore.verify_before_restore);
        assert_eq!(config.schedule.schedules.len(), 1);
        assert_eq!(config.schedule.schedules[&BackupTier::Daily].retention, 14);
        assert_eq!(config.mirror.unwrap().directory, Path::new("/mnt/offsite"));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            BackupEngineConfig::from_toml("[schedule.schedules.yearly]\nenabled = true"),
            Err(BackupError::ConfigError(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let vars = HashMap::from([
            (ENV_ROOT, "/data/backups"),
            (ENV_COMPRESSION, "gzip"),
            (ENV_MIRROR_DIR, "/mnt/share"),
            (ENV_SCHEDULER_ENABLED, "false"),
        ]);

        let mut config = BackupEngineConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.repository.path, Path::new("/data/backups"));
        assert_eq!(config.repository.compression.default_type, CompressionType::Gzip);
        assert_eq!(config.mirror.unwrap().directory, Path::new("/mnt/share"));
        assert!(!config.schedule.enabled);
    }

    #[test]
    fn test_invalid_override() {
        let mut config = BackupEngineConfig::default();
        let result = config.apply_overrides(|key| {
            (key == ENV_SCHEDULER_ENABLED).then(|| "sometimes".to_string())
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.toml");
        tokio::fs::write(&path, "[schedule]\nenabled = false\n").await.unwrap();

        let config = BackupEngineConfig::load_from_file(&path).await.unwrap();
        assert!(!config.schedule.enabled);
        assert_eq!(config.schedule.schedules.len(), 4);

        assert!(BackupEngineConfig::load_from_file(&dir.path().join("missing.toml"))
            .await
            .is_err());
    }
}
