/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Off-site copies of finished artifacts
//!
//! Mirroring is best-effort. The local artifact is always authoritative and a
//! mirror failure never invalidates it.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Remote sink for finished artifacts
#[async_trait]
pub trait RemoteMirror: Send + Sync + std::fmt::Debug {
    /// Upload a local artifact, returning the remote key it was stored under
    async fn upload(&self, local_path: &Path, backup_id: &str) -> anyhow::Result<String>;
}

/// Mirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Mounted directory (network share, bucket mount) receiving copies
    pub directory: PathBuf,
}

/// Mirror that copies artifacts into a mounted directory
#[derive(Debug)]
pub struct DirectoryMirror {
    target: PathBuf,
}

impl DirectoryMirror {
    pub fn new(config: &MirrorConfig) -> Self {
        Self {
            target: config.directory.clone(),
        }
    }
}

#[async_trait]
impl RemoteMirror for DirectoryMirror {
    async fn upload(&self, local_path: &Path, backup_id: &str) -> anyhow::Result<String> {
        let file_name = local_path
            .file_name()
            .context("artifact path has no file name")?
            .to_string_lossy()
            .to_string();
        let prefix = match crate::artifact::parse_backup_id(backup_id) {
            Some((tier, _)) => tier.as_str(),
            None => "unsorted",
        };

        let key = format!("{}/{}", prefix, file_name);
        let destination = self.target.join(prefix);
        tokio::fs::create_dir_all(&destination)
            .await
            .with_context(|| format!("creating {}", destination.display()))?;
        tokio::fs::copy(local_path, destination.join(&file_name))
            .await
            .with_context(|| format!("copying {} to mirror", local_path.display()))?;

        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_directory_mirror_copies_into_tier_prefix() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let local = source.path().join("daily_2026-01-01T00-00-00-000Z.json");
        tokio::fs::write(&local, b"{}").await.unwrap();

        let mirror = DirectoryMirror::new(&MirrorConfig {
            directory: target.path().to_path_buf(),
        });
        let key = mirror
            .upload(&local, "daily_2026-01-01T00-00-00-000Z")
            .await
            .unwrap();

        assert_eq!(key, "daily/daily_2026-01-01T00-00-00-000Z.json");
        assert!(target.path().join(&key).exists());
    }

    #[tokio::test]
    async fn test_missing_source_is_an_error() {
        let target = TempDir::new().unwrap();
        let mirror = DirectoryMirror::new(&MirrorConfig {
            directory: target.path().to_path_buf(),
        });

        let result = mirror
            .upload(Path::new("/nonexistent/manual_x.json"), "manual_x")
            .await;
        assert!(result.is_err());
    }
}
