/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Structural validation of stored artifacts
//!
//! Validation only ever reads. A structural problem is an expected outcome and
//! is reported through [`ValidationReport`], never as an error.

use crate::{
    artifact::{BackupArtifact, DOCUMENT_STORE_KEY, TREE_STORE_KEY},
    storage::{decompress_for, BackupRepository},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::{path::PathBuf, sync::Arc};
use tracing::{debug, warn};

/// Metadata fields every artifact must carry
const REQUIRED_METADATA: [&str; 4] = ["backupId", "type", "timestamp", "version"];

/// Outcome of validating one artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub reason: Option<String>,
    pub summary: Option<ValidationSummary>,
}

/// What a valid artifact contains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub backup_id: String,
    pub tier: String,
    pub timestamp: String,
    pub version: String,
    pub path: PathBuf,
    pub has_document_store: bool,
    pub has_tree_store: bool,
    pub collection_count: usize,
    pub document_count: usize,
    pub size_bytes: u64,
    /// SHA-256 of the stored (possibly compressed) bytes
    pub checksum: String,
}

impl ValidationReport {
    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
            summary: None,
        }
    }
}

/// Read-only artifact inspector
#[derive(Debug, Clone)]
pub struct BackupValidator {
    repository: Arc<BackupRepository>,
}

impl BackupValidator {
    pub fn new(repository: Arc<BackupRepository>) -> Self {
        Self { repository }
    }

    /// Validate the artifact stored under `backup_id`
    pub async fn validate(&self, backup_id: &str) -> ValidationReport {
        debug!("Validating backup: {}", backup_id);

        let (path, bytes) = match self.repository.read_raw(backup_id).await {
            Ok(Some(found)) => found,
            Ok(None) => return ValidationReport::invalid(format!("Backup not found: {}", backup_id)),
            Err(e) => return ValidationReport::invalid(format!("Backup file is unreadable: {}", e)),
        };

        let size_bytes = bytes.len() as u64;
        let checksum = format!("{:x}", Sha256::digest(&bytes));

        let json = match decompress_for(&path, bytes).await {
            Ok(json) => json,
            Err(e) => return ValidationReport::invalid(format!("Backup file cannot be decoded: {}", e)),
        };

        let report = inspect(&json, path, size_bytes, checksum);
        if !report.valid {
            warn!(
                "Backup {} failed validation: {}",
                backup_id,
                report.reason.as_deref().unwrap_or("unknown")
            );
        }
        report
    }
}

/// Check the decoded JSON of an artifact
fn inspect(json: &[u8], path: PathBuf, size_bytes: u64, checksum: String) -> ValidationReport {
    let root_value: Value = match serde_json::from_slice(json) {
        Ok(root) => root,
        Err(e) => return ValidationReport::invalid(format!("Backup file is not valid JSON: {}", e)),
    };
    let Some(root) = root_value.as_object() else {
        return ValidationReport::invalid("Backup root is not an object");
    };

    let Some(metadata) = root.get("metadata").and_then(Value::as_object) else {
        return ValidationReport::invalid("Backup metadata is missing");
    };
    for field in REQUIRED_METADATA {
        if metadata.get(field).map_or(true, Value::is_null) {
            return ValidationReport::invalid(format!(
                "Backup metadata is missing required field: {}",
                field
            ));
        }
    }

    let documents = root.get(DOCUMENT_STORE_KEY).filter(|v| is_container(v));
    let tree = root.get(TREE_STORE_KEY).filter(|v| is_container(v));
    if documents.is_none() && tree.is_none() {
        return ValidationReport::invalid("Backup contains no document store or tree store data");
    }

    let mut collection_count = 0;
    let mut document_count = 0;
    if let Some(Value::Object(collections)) = documents {
        for (name, collection) in collections {
            let Some(collection) = collection.as_object() else {
                return ValidationReport::invalid(format!("Collection {} is not an object", name));
            };
            if let Some((id, _)) = collection.iter().find(|(_, document)| !document.is_object()) {
                return ValidationReport::invalid(format!(
                    "Document {}/{} is not an object",
                    name, id
                ));
            }
            collection_count += 1;
            document_count += collection.len();
        }
    }

    // Restore reads the typed layout, so anything it would reject is invalid
    let artifact = match BackupArtifact::deserialize(&root_value) {
        Ok(artifact) => artifact,
        Err(e) => return ValidationReport::invalid(format!("Backup layout is not restorable: {}", e)),
    };
    let metadata = artifact.metadata;

    ValidationReport {
        valid: true,
        reason: None,
        summary: Some(ValidationSummary {
            backup_id: metadata.backup_id,
            tier: metadata.tier.to_string(),
            timestamp: metadata.timestamp.to_rfc3339(),
            version: metadata.version,
            path,
            has_document_store: documents.is_some(),
            has_tree_store: tree.is_some(),
            collection_count,
            document_count,
            size_bytes,
            checksum,
        }),
    }
}

fn is_container(value: &Value) -> bool {
    matches!(value, Value::Object(_) | Value::Array(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        artifact::{BackupArtifact, BackupTier, DocumentDataset},
        storage::RepositoryConfig,
    };
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (BackupValidator, Arc<BackupRepository>, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = RepositoryConfig {
            path: dir.path().to_path_buf(),
            ..Default::default()
        };
        let repository = Arc::new(BackupRepository::open(&config, None).await.unwrap());
        (BackupValidator::new(repository.clone()), repository, dir)
    }

    fn write_daily(dir: &TempDir, name: &str, contents: &[u8]) {
        let tier_dir = dir.path().join("daily");
        std::fs::create_dir_all(&tier_dir).unwrap();
        std::fs::write(tier_dir.join(name), contents).unwrap();
    }

    #[tokio::test]
    async fn test_valid_artifact_summary() {
        let (validator, repository, _dir) = setup().await;
        let mut artifact = BackupArtifact::new(
            BackupTier::Daily,
            Utc::now(),
            Some(DocumentDataset::new()),
            Some(json!({"status": "ok"})),
        );
        let persisted = repository.persist(&mut artifact).await.unwrap();

        let report = validator.validate(artifact.id()).await;
        assert!(report.valid, "{:?}", report.reason);
        let summary = report.summary.unwrap();
        assert_eq!(summary.backup_id, artifact.id());
        assert_eq!(summary.tier, "daily");
        assert!(summary.has_document_store);
        assert!(summary.has_tree_store);
        assert_eq!(summary.size_bytes, persisted.size_bytes);
        assert_eq!(summary.checksum.len(), 64);
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let (validator, _repository, _dir) = setup().await;
        let report = validator.validate("daily_1999").await;
        assert!(!report.valid);
        assert!(report.reason.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_unparsable_artifact() {
        let (validator, _repository, dir) = setup().await;
        write_daily(&dir, "daily_broken.json", b"{\"metadata\": ");

        let report = validator.validate("daily_broken").await;
        assert!(!report.valid);
        assert!(report.reason.unwrap().contains("not valid JSON"));
        // Left in place for inspection
        assert!(dir.path().join("daily/daily_broken.json").exists());
    }

    #[tokio::test]
    async fn test_missing_metadata_field() {
        let (validator, _repository, dir) = setup().await;
        let raw = json!({
            "metadata": {"backupId": "daily_x", "type": "daily", "version": "1.0"},
            "documentStore": {},
            "treeStore": null
        });
        write_daily(&dir, "daily_x.json", raw.to_string().as_bytes());

        let report = validator.validate("daily_x").await;
        assert!(!report.valid);
        assert!(report.reason.unwrap().contains("timestamp"));
    }

    #[tokio::test]
    async fn test_scalar_datasets_are_rejected() {
        let (validator, _repository, dir) = setup().await;
        let raw = json!({
            "metadata": {
                "backupId": "daily_y", "type": "daily",
                "timestamp": "2026-01-01T00:00:00Z", "version": "1.0"
            },
            "documentStore": null,
            "treeStore": 42
        });
        write_daily(&dir, "daily_y.json", raw.to_string().as_bytes());

        let report = validator.validate("daily_y").await;
        assert!(!report.valid);
        assert!(report.reason.unwrap().contains("no document store or tree store"));
    }

    #[tokio::test]
    async fn test_malformed_collection() {
        let (validator, _repository, dir) = setup().await;
        let raw = json!({
            "metadata": {
                "backupId": "daily_z", "type": "daily",
                "timestamp": "2026-01-01T00:00:00Z", "version": "1.0"
            },
            "documentStore": {"bins": {"a": 1}},
            "treeStore": null
        });
        write_daily(&dir, "daily_z.json", raw.to_string().as_bytes());

        let report = validator.validate("daily_z").await;
        assert!(!report.valid);
        assert!(report.reason.unwrap().contains("bins/a"));
    }

    #[tokio::test]
    async fn test_shapes_the_loader_rejects() {
        let (validator, _repository, dir) = setup().await;
        let metadata = |id: &str| {
            json!({
                "backupId": id, "type": "daily",
                "timestamp": "2026-01-01T00:00:00Z", "version": "1.0"
            })
        };

        let mut unknown_tier = metadata("daily_tier");
        unknown_tier["type"] = json!("yearly");
        let mut numeric_version = metadata("daily_version");
        numeric_version["version"] = json!(1);
        let mut bad_timestamp = metadata("daily_time");
        bad_timestamp["timestamp"] = json!("yesterday");

        let cases = [
            ("daily_list", json!({"metadata": metadata("daily_list"), "documentStore": []}), "sequence"),
            ("daily_tier", json!({"metadata": unknown_tier, "treeStore": {}}), "yearly"),
            ("daily_version", json!({"metadata": numeric_version, "treeStore": {}}), "integer"),
            ("daily_time", json!({"metadata": bad_timestamp, "treeStore": {}}), "restorable"),
        ];

        for (id, raw, expected) in cases {
            write_daily(&dir, &format!("{}.json", id), raw.to_string().as_bytes());

            let report = validator.validate(id).await;
            assert!(!report.valid, "{} passed validation", id);
            let reason = report.reason.unwrap();
            assert!(reason.contains("not restorable"), "{}: {}", id, reason);
            assert!(reason.contains(expected), "{}: {}", id, reason);
        }
    }

    #[tokio::test]
    async fn test_validation_is_read_only() {
        let (validator, repository, _dir) = setup().await;
        let mut artifact = BackupArtifact::new(
            BackupTier::Weekly,
            Utc::now(),
            Some(DocumentDataset::new()),
            None,
        );
        let persisted = repository.persist(&mut artifact).await.unwrap();

        let before = std::fs::read(&persisted.path).unwrap();
        let modified = std::fs::metadata(&persisted.path).unwrap().modified().unwrap();

        for _ in 0..3 {
            assert!(validator.validate(artifact.id()).await.valid);
        }

        assert_eq!(std::fs::read(&persisted.path).unwrap(), before);
        assert_eq!(
            std::fs::metadata(&persisted.path).unwrap().modified().unwrap(),
            modified
        );
    }
}
