/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Durable artifact repository
//!
//! Layout under the repository root:
//!
//! ```text
//! <root>/index.json              id -> tier lookup table
//! <root>/<tier>/<id>.json[.gz|.zst|.lz4]
//! ```
//!
//! Each artifact has exactly one canonical file in its tier directory. Files
//! found directly under the root are legacy copies written by older tooling;
//! they are still found by id but never listed.

use crate::{
    artifact::{parse_backup_id, BackupArtifact, BackupTier, RetentionWindow},
    compression::{CompressionConfig, CompressionType},
    error::{BackupError, Result},
    mirror::RemoteMirror,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// File holding the id -> tier index
pub const INDEX_FILE: &str = "index.json";

/// Repository configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub path: PathBuf,
    pub create_directories: bool,
    pub compression: CompressionConfig,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: "/var/lib/backup-engine/backups".into(),
            create_directories: true,
            compression: CompressionConfig::default(),
        }
    }
}

/// Outcome of persisting one artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistResult {
    pub backup_id: String,
    pub tier: BackupTier,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub remote_key: Option<String>,
}

/// Listing entry for a stored artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub id: String,
    pub tier: BackupTier,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Per-tier totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStats {
    pub count: usize,
    pub size_bytes: u64,
}

/// Repository statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryStats {
    pub total_count: usize,
    pub total_size_bytes: u64,
    pub per_tier: BTreeMap<BackupTier, TierStats>,
    pub oldest: Option<ArtifactSummary>,
    pub newest: Option<ArtifactSummary>,
}

/// Filesystem-backed artifact repository
#[derive(Debug)]
pub struct BackupRepository {
    config: RepositoryConfig,
    index: Mutex<BTreeMap<String, BackupTier>>,
    mirror: Option<Arc<dyn RemoteMirror>>,
}

impl BackupRepository {
    /// Open (and if configured, create) a repository
    pub async fn open(
        config: &RepositoryConfig,
        mirror: Option<Arc<dyn RemoteMirror>>,
    ) -> Result<Self> {
        if config.create_directories {
            tokio::fs::create_dir_all(&config.path).await?;
        }

        let index = load_index(&config.path).await?;
        info!(
            "Opened backup repository at {} ({} indexed artifacts)",
            config.path.display(),
            index.len()
        );

        Ok(Self {
            config: config.clone(),
            index: Mutex::new(index),
            mirror,
        })
    }

    pub fn root(&self) -> &Path {
        &self.config.path
    }

    pub fn tier_dir(&self, tier: BackupTier) -> PathBuf {
        self.config.path.join(tier.as_str())
    }

    /// Serialize an artifact into its tier directory and record it in the index.
    ///
    /// Sets `artifact.size_bytes` to the number of bytes written. An existing
    /// artifact with the same id is never replaced.
    pub async fn persist(&self, artifact: &mut BackupArtifact) -> Result<PersistResult> {
        let tier = artifact.tier();
        let backup_id = artifact.id().to_string();
        let compression = self.config.compression.default_type;
        let level = self.config.compression.level;

        let json = artifact.to_json_bytes()?;
        let bytes = tokio::task::spawn_blocking(move || compression.compress(&json, level))
            .await
            .map_err(BackupError::join)??;
        let size_bytes = bytes.len() as u64;

        let tier_dir = self.tier_dir(tier);
        let path = tier_dir.join(compression.file_name(&backup_id));
        write_atomic(tier_dir, path.clone(), bytes)
            .await
            .map_err(|e| match e {
                BackupError::IoError(io) if io.kind() == std::io::ErrorKind::AlreadyExists => {
                    BackupError::AlreadyExists(backup_id.clone())
                }
                e => e,
            })?;
        artifact.size_bytes = Some(size_bytes);

        {
            let mut index = self.index.lock().await;
            index.insert(backup_id.clone(), tier);
            if let Err(e) = save_index(&self.config.path, &index).await {
                warn!("Failed to update backup index after persisting {}: {}", backup_id, e);
            }
        }

        info!(
            "Persisted backup {} to {} ({} bytes)",
            backup_id,
            path.display(),
            size_bytes
        );

        let remote_key = self.mirror(&path, &backup_id).await;

        Ok(PersistResult {
            backup_id,
            tier,
            path,
            size_bytes,
            remote_key,
        })
    }

    /// Best-effort upload to the configured mirror. Failures are logged only.
    pub async fn mirror(&self, path: &Path, backup_id: &str) -> Option<String> {
        let mirror = self.mirror.as_ref()?;

        match mirror.upload(path, backup_id).await {
            Ok(key) => {
                info!("Mirrored backup {} as {}", backup_id, key);
                Some(key)
            }
            Err(e) => {
                warn!("Mirror upload failed for backup {}: {:#}", backup_id, e);
                None
            }
        }
    }

    /// Locate an artifact file.
    ///
    /// Exact index hit first, then the flat root, then every tier directory,
    /// matching on a substring of the file name. First match wins.
    pub async fn find(&self, backup_id: &str) -> Result<Option<PathBuf>> {
        if backup_id.trim().is_empty() {
            return Ok(None);
        }

        let indexed = self.index.lock().await.get(backup_id).copied();
        if let Some(tier) = indexed {
            if let Some(path) = self.locate_exact(tier, backup_id).await {
                return Ok(Some(path));
            }
            debug!("Index entry for {} is stale, scanning", backup_id);
        }

        let root = self.config.path.clone();
        let backup_id = backup_id.to_string();
        tokio::task::spawn_blocking(move || scan_for(&root, &backup_id))
            .await
            .map_err(BackupError::join)
    }

    /// Read the stored bytes of an artifact, still compressed
    pub async fn read_raw(&self, backup_id: &str) -> Result<Option<(PathBuf, Vec<u8>)>> {
        match self.find(backup_id).await? {
            Some(path) => {
                let bytes = tokio::fs::read(&path).await?;
                Ok(Some((path, bytes)))
            }
            None => Ok(None),
        }
    }

    /// Find and decode an artifact
    pub async fn load(&self, backup_id: &str) -> Result<Option<BackupArtifact>> {
        match self.read_raw(backup_id).await? {
            Some((path, bytes)) => {
                let size_bytes = bytes.len() as u64;
                let json = decompress_for(&path, bytes).await?;
                let mut artifact = BackupArtifact::from_json_bytes(&json).map_err(|e| {
                    BackupError::InvalidFormat(format!("{}: {}", path.display(), e))
                })?;
                artifact.size_bytes = Some(size_bytes);
                Ok(Some(artifact))
            }
            None => Ok(None),
        }
    }

    /// Every artifact in the tier directories, newest first
    pub async fn list(&self) -> Result<Vec<ArtifactSummary>> {
        self.scan(BackupTier::ALL.to_vec()).await
    }

    /// Artifacts of one tier, newest first
    pub async fn list_tier(&self, tier: BackupTier) -> Result<Vec<ArtifactSummary>> {
        self.scan(vec![tier]).await
    }

    /// Delete every stored copy of an artifact. Returns whether anything was removed.
    pub async fn delete(&self, backup_id: &str) -> Result<bool> {
        let mut candidates = Vec::new();
        for dir in std::iter::once(self.config.path.clone())
            .chain(BackupTier::ALL.iter().map(|tier| self.tier_dir(*tier)))
        {
            for compression in COMPRESSIONS {
                candidates.push(dir.join(compression.file_name(backup_id)));
            }
        }

        let mut removed = false;
        for path in candidates {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    info!("Deleted backup file {}", path.display());
                    removed = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.forget(&[backup_id.to_string()]).await;
        Ok(removed)
    }

    /// Delete artifacts of `tier` older than the retention window
    pub async fn delete_expired(&self, tier: BackupTier, window: RetentionWindow) -> Result<usize> {
        self.delete_expired_at(tier, window, Utc::now()).await
    }

    /// [`Self::delete_expired`] evaluated against an explicit `now`
    pub async fn delete_expired_at(
        &self,
        tier: BackupTier,
        window: RetentionWindow,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let cutoff = window.cutoff(now);
        let expired: Vec<ArtifactSummary> = self
            .list_tier(tier)
            .await?
            .into_iter()
            .filter(|artifact| artifact.tier == tier && artifact.created_at < cutoff)
            .collect();

        let removed_ids = self.remove_expired(&expired).await;
        self.forget(&removed_ids).await;

        if !removed_ids.is_empty() {
            info!(
                "Deleted {} expired {} backups older than {}",
                removed_ids.len(),
                tier,
                cutoff
            );
        }
        Ok(removed_ids.len())
    }

    /// Remove each artifact file, skipping those that fail. Returns the ids
    /// actually removed.
    async fn remove_expired(&self, expired: &[ArtifactSummary]) -> Vec<String> {
        let mut removed_ids = Vec::with_capacity(expired.len());
        for artifact in expired {
            match tokio::fs::remove_file(&artifact.path).await {
                Ok(()) => {
                    debug!("Deleted expired backup {}", artifact.id);
                    self.remove_legacy_copies(&artifact.id).await;
                    removed_ids.push(artifact.id.clone());
                }
                Err(e) => {
                    warn!(
                        "Failed to delete expired backup {} at {}: {}",
                        artifact.id,
                        artifact.path.display(),
                        e
                    );
                }
            }
        }
        removed_ids
    }

    /// Aggregate statistics, derived from [`Self::list`]
    pub async fn stats(&self) -> Result<RepositoryStats> {
        let artifacts = self.list().await?;
        let mut stats = RepositoryStats::default();

        for artifact in &artifacts {
            stats.total_count += 1;
            stats.total_size_bytes += artifact.size_bytes;
            let tier = stats.per_tier.entry(artifact.tier).or_default();
            tier.count += 1;
            tier.size_bytes += artifact.size_bytes;
        }
        stats.newest = artifacts.first().cloned();
        stats.oldest = artifacts.last().cloned();

        Ok(stats)
    }

    async fn scan(&self, tiers: Vec<BackupTier>) -> Result<Vec<ArtifactSummary>> {
        let root = self.config.path.clone();
        let mut artifacts = tokio::task::spawn_blocking(move || {
            tiers
                .into_iter()
                .flat_map(|tier| scan_tier(&root, tier))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(BackupError::join)?;

        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(artifacts)
    }

    async fn locate_exact(&self, tier: BackupTier, backup_id: &str) -> Option<PathBuf> {
        let dir = self.tier_dir(tier);
        for compression in COMPRESSIONS {
            let path = dir.join(compression.file_name(backup_id));
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Some(path);
            }
        }
        None
    }

    async fn remove_legacy_copies(&self, backup_id: &str) {
        for compression in COMPRESSIONS {
            let path = self.config.path.join(compression.file_name(backup_id));
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Deleted legacy copy {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to delete legacy copy {}: {}", path.display(), e),
            }
        }
    }

    async fn forget(&self, backup_ids: &[String]) {
        if backup_ids.is_empty() {
            return;
        }

        let mut index = self.index.lock().await;
        let before = index.len();
        for id in backup_ids {
            index.remove(id);
        }
        if index.len() != before {
            if let Err(e) = save_index(&self.config.path, &index).await {
                warn!("Failed to update backup index after deletion: {}", e);
            }
        }
    }
}

const COMPRESSIONS: [CompressionType; 4] = [
    CompressionType::None,
    CompressionType::Gzip,
    CompressionType::Zstd,
    CompressionType::Lz4,
];

/// Decompress stored bytes according to the file's extension
pub async fn decompress_for(path: &Path, bytes: Vec<u8>) -> Result<Vec<u8>> {
    let compression = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(CompressionType::parse_file_name)
        .map(|(_, compression)| compression)
        .unwrap_or(CompressionType::None);

    if compression == CompressionType::None {
        return Ok(bytes);
    }
    tokio::task::spawn_blocking(move || compression.decompress(&bytes))
        .await
        .map_err(BackupError::join)?
}

/// Write through a temp file in the destination directory, then move it into
/// place. Fails with `AlreadyExists` instead of overwriting `path`.
async fn write_atomic(dir: PathBuf, path: PathBuf, bytes: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(&dir)?;
        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        file.write_all(&bytes)?;
        file.as_file().sync_all()?;
        file.persist_noclobber(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(BackupError::join)?
}

async fn load_index(root: &Path) -> Result<BTreeMap<String, BackupTier>> {
    let path = root.join(INDEX_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(index) => return Ok(index),
            Err(e) => warn!("Backup index {} is unreadable, rebuilding: {}", path.display(), e),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        BackupTier::ALL
            .iter()
            .flat_map(|tier| scan_tier(&root, *tier))
            .map(|artifact| (artifact.id, artifact.tier))
            .collect()
    })
    .await
    .map_err(BackupError::join)
}

async fn save_index(root: &Path, index: &BTreeMap<String, BackupTier>) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(index)?;
    write_atomic(root.to_path_buf(), root.join(INDEX_FILE), bytes).await
}

/// Artifact files directly inside `dir`, sorted by name
fn artifact_files(dir: &Path) -> Vec<(PathBuf, String)> {
    if !dir.is_dir() {
        return Vec::new();
    }

    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Skipping unreadable entry in {}: {}", dir.display(), e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            if name == INDEX_FILE {
                return None;
            }
            CompressionType::parse_file_name(&name)?;
            Some((entry.into_path(), name))
        })
        .collect()
}

fn scan_for(root: &Path, backup_id: &str) -> Option<PathBuf> {
    std::iter::once(root.to_path_buf())
        .chain(BackupTier::ALL.iter().map(|tier| root.join(tier.as_str())))
        .find_map(|dir| {
            artifact_files(&dir)
                .into_iter()
                .find(|(_, name)| name.contains(backup_id))
                .map(|(path, _)| path)
        })
}

fn scan_tier(root: &Path, tier: BackupTier) -> Vec<ArtifactSummary> {
    artifact_files(&root.join(tier.as_str()))
        .into_iter()
        .filter_map(|(path, name)| {
            let (id, _) = CompressionType::parse_file_name(&name)?;
            let id = id.to_string();
            let metadata = match std::fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    debug!("Skipping {}: {}", path.display(), e);
                    return None;
                }
            };
            let modified_at: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let created_at = parse_backup_id(&id)
                .map(|(_, created_at)| created_at)
                .unwrap_or(modified_at);

            Some(ArtifactSummary {
                id,
                tier,
                path,
                size_bytes: metadata.len(),
                created_at,
                modified_at,
            })
        })
        .collect()
}
