/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Backup artifact model and on-disk document layout
//!
//! An artifact is one self-contained JSON document with three top-level keys:
//!
//! ```text
//! {
//!   "metadata":      { "backupId", "type", "timestamp", "version", "stores", "hostname" },
//!   "documentStore": { <collection>: { <document id>: { "fields", "createTime", "updateTime" } } },
//!   "treeStore":     <any JSON value>
//! }
//! ```
//!
//! Other tools read these files directly, so the key names are part of the
//! contract and must not change.

use crate::error::{BackupError, Result};
use chrono::{DateTime, Duration, Months, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Schema version written into `metadata.version`
pub const SCHEMA_VERSION: &str = "1.0";

/// Store names listed in `metadata.stores`
pub const DOCUMENT_STORE_KEY: &str = "documentStore";
pub const TREE_STORE_KEY: &str = "treeStore";

/// Timestamp layout used inside artifact ids (no colons, safe for file names)
const ID_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3fZ";

/// Id timestamp layout without the millisecond component
const ID_TIMESTAMP_FORMAT_SECONDS: &str = "%Y-%m-%dT%H-%M-%SZ";

/// Retention category of a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackupTier {
    Manual,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Test,
    Setup,
    /// Safety snapshot taken right before a restore overwrites live data
    PreRestore,
}

impl BackupTier {
    /// Every tier, in directory scan order
    pub const ALL: [BackupTier; 8] = [
        BackupTier::Manual,
        BackupTier::Hourly,
        BackupTier::Daily,
        BackupTier::Weekly,
        BackupTier::Monthly,
        BackupTier::Test,
        BackupTier::Setup,
        BackupTier::PreRestore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupTier::Manual => "manual",
            BackupTier::Hourly => "hourly",
            BackupTier::Daily => "daily",
            BackupTier::Weekly => "weekly",
            BackupTier::Monthly => "monthly",
            BackupTier::Test => "test",
            BackupTier::Setup => "setup",
            BackupTier::PreRestore => "pre-restore",
        }
    }

    /// Interpret a retention amount in the unit this tier is configured in.
    ///
    /// Hourly backups are retained in hours, daily in days, weekly in weeks
    /// and monthly in calendar months. Every other tier counts days.
    pub fn retention_window(&self, amount: u32) -> RetentionWindow {
        match self {
            BackupTier::Hourly => RetentionWindow::Hours(amount),
            BackupTier::Weekly => RetentionWindow::Weeks(amount),
            BackupTier::Monthly => RetentionWindow::Months(amount),
            _ => RetentionWindow::Days(amount),
        }
    }
}

impl fmt::Display for BackupTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupTier {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        BackupTier::ALL
            .iter()
            .copied()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| BackupError::ConfigError(format!("Unknown backup tier: {}", s)))
    }
}

impl Serialize for BackupTier {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BackupTier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Age threshold after which an artifact becomes eligible for deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "amount", rename_all = "lowercase")]
pub enum RetentionWindow {
    Hours(u32),
    Days(u32),
    Weeks(u32),
    Months(u32),
}

impl RetentionWindow {
    /// Instant before which artifacts are expired.
    ///
    /// Windows reaching past the earliest representable instant saturate to
    /// it, so nothing expires.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let cutoff = match *self {
            RetentionWindow::Hours(n) => {
                Duration::try_hours(n as i64).and_then(|d| now.checked_sub_signed(d))
            }
            RetentionWindow::Days(n) => {
                Duration::try_days(n as i64).and_then(|d| now.checked_sub_signed(d))
            }
            RetentionWindow::Weeks(n) => {
                Duration::try_weeks(n as i64).and_then(|d| now.checked_sub_signed(d))
            }
            RetentionWindow::Months(n) => now.checked_sub_months(Months::new(n)),
        };
        cutoff.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// One document captured from the document store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    #[serde(alias = "data", default)]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<DateTime<Utc>>,
}

/// Document id → document
pub type CollectionDataset = BTreeMap<String, DocumentRecord>;

/// Collection name → collection
pub type DocumentDataset = BTreeMap<String, CollectionDataset>;

/// Artifact metadata block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    pub backup_id: String,
    #[serde(rename = "type")]
    pub tier: BackupTier,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    #[serde(default)]
    pub stores: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// Point-in-time snapshot of both stores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupArtifact {
    pub metadata: ArtifactMetadata,
    #[serde(default)]
    pub document_store: Option<DocumentDataset>,
    #[serde(default)]
    pub tree_store: Option<Value>,
    /// Serialized size, known once the artifact has been written
    #[serde(skip)]
    pub size_bytes: Option<u64>,
}

impl BackupArtifact {
    /// Assemble an artifact captured at `created_at`
    pub fn new(
        tier: BackupTier,
        created_at: DateTime<Utc>,
        document_store: Option<DocumentDataset>,
        tree_store: Option<Value>,
    ) -> Self {
        let mut stores = Vec::with_capacity(2);
        if document_store.is_some() {
            stores.push(DOCUMENT_STORE_KEY.to_string());
        }
        if tree_store.is_some() {
            stores.push(TREE_STORE_KEY.to_string());
        }

        Self {
            metadata: ArtifactMetadata {
                backup_id: generate_backup_id(tier, created_at),
                tier,
                timestamp: created_at,
                version: SCHEMA_VERSION.to_string(),
                stores,
                hostname: Some(gethostname::gethostname().to_string_lossy().to_string()),
            },
            document_store,
            tree_store,
            size_bytes: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.backup_id
    }

    pub fn tier(&self) -> BackupTier {
        self.metadata.tier
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.metadata.timestamp
    }

    pub fn schema_version(&self) -> &str {
        &self.metadata.version
    }

    /// Total number of documents across all collections
    pub fn document_count(&self) -> usize {
        self.document_store
            .as_ref()
            .map(|dataset| dataset.values().map(|c| c.len()).sum())
            .unwrap_or(0)
    }

    /// Serialize to the JSON file layout
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse the JSON file layout
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Build the `{tier}_{timestamp}` artifact identifier
pub fn generate_backup_id(tier: BackupTier, created_at: DateTime<Utc>) -> String {
    format!("{}_{}", tier.as_str(), created_at.format(ID_TIMESTAMP_FORMAT))
}

/// Recover tier and creation instant from an artifact identifier
pub fn parse_backup_id(id: &str) -> Option<(BackupTier, DateTime<Utc>)> {
    let (tier, timestamp) = id.split_once('_')?;
    let tier = tier.parse().ok()?;
    Some((tier, parse_id_timestamp(timestamp)?))
}

/// Parse `YYYY-MM-DDTHH-MM-SS-mmmZ` (milliseconds optional)
fn parse_id_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, ID_TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(value, ID_TIMESTAMP_FORMAT_SECONDS))
        .ok()
        .map(|timestamp| timestamp.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};
    use serde_json::json;

    fn sample_artifact() -> BackupArtifact {
        let mut bins = CollectionDataset::new();
        bins.insert(
            "bin-1".to_string(),
            DocumentRecord {
                fields: json!({"fill": 40}).as_object().unwrap().clone(),
                create_time: None,
                update_time: None,
            },
        );
        let mut dataset = DocumentDataset::new();
        dataset.insert("bins".to_string(), bins);

        BackupArtifact::new(
            BackupTier::Daily,
            Utc.with_ymd_and_hms(2026, 3, 4, 2, 0, 5).unwrap(),
            Some(dataset),
            Some(json!({"status": "ok"})),
        )
    }

    #[test]
    fn test_backup_id_format() {
        let created = Utc.with_ymd_and_hms(2026, 3, 4, 2, 0, 5).unwrap();
        let id = generate_backup_id(BackupTier::Daily, created);
        assert_eq!(id, "daily_2026-03-04T02-00-05-000Z");
        assert!(!id.contains(':'));
    }

    #[test]
    fn test_parse_backup_id() {
        let (tier, created) = parse_backup_id("pre-restore_2026-03-04T02-00-05-123Z").unwrap();
        assert_eq!(tier, BackupTier::PreRestore);
        assert_eq!(created.year(), 2026);
        assert_eq!(created.second(), 5);
        assert_eq!(created.timestamp_subsec_millis(), 123);

        // Without milliseconds
        assert!(parse_backup_id("weekly_2026-03-04T02-00-05Z").is_some());

        assert!(parse_backup_id("weekly").is_none());
        assert!(parse_backup_id("yearly_2026-03-04T02-00-05Z").is_none());
        assert!(parse_backup_id("daily_2026-03-04T02:00:05Z").is_none());
        assert!(parse_backup_id("daily_2026-03-04T25-00-05-000Z").is_none());
        assert!(parse_backup_id("daily_2026-03-04T02-00-05-000").is_none());
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!("Daily".parse::<BackupTier>().unwrap(), BackupTier::Daily);
        assert_eq!("pre-restore".parse::<BackupTier>().unwrap(), BackupTier::PreRestore);
        assert!("yearly".parse::<BackupTier>().is_err());
    }

    #[test]
    fn test_retention_windows() {
        let now = Utc.with_ymd_and_hms(2026, 3, 31, 12, 0, 0).unwrap();

        assert_eq!(BackupTier::Hourly.retention_window(24).cutoff(now), now - Duration::hours(24));
        assert_eq!(BackupTier::Daily.retention_window(30).cutoff(now), now - Duration::days(30));
        assert_eq!(BackupTier::Weekly.retention_window(2).cutoff(now), now - Duration::days(14));
        assert_eq!(BackupTier::Manual.retention_window(7), RetentionWindow::Days(7));

        // Calendar months clamp to the end of shorter months
        let cutoff = BackupTier::Monthly.retention_window(1).cutoff(now);
        assert_eq!((cutoff.month(), cutoff.day()), (2, 28));
    }

    #[test]
    fn test_oversized_retention_saturates() {
        let now = Utc.with_ymd_and_hms(2026, 3, 31, 12, 0, 0).unwrap();

        for window in [
            RetentionWindow::Hours(u32::MAX),
            RetentionWindow::Days(u32::MAX),
            RetentionWindow::Weeks(20_000_000),
            RetentionWindow::Weeks(u32::MAX),
            RetentionWindow::Months(u32::MAX),
        ] {
            assert_eq!(window.cutoff(now), DateTime::<Utc>::MIN_UTC, "{:?}", window);
        }
    }

    #[test]
    fn test_artifact_layout() {
        let artifact = sample_artifact();
        let value: Value = serde_json::from_slice(&artifact.to_json_bytes().unwrap()).unwrap();

        let root = value.as_object().unwrap();
        assert!(root.contains_key("metadata"));
        assert!(root.contains_key("documentStore"));
        assert!(root.contains_key("treeStore"));

        let metadata = &value["metadata"];
        assert_eq!(metadata["backupId"], "daily_2026-03-04T02-00-05-000Z");
        assert_eq!(metadata["type"], "daily");
        assert_eq!(metadata["version"], SCHEMA_VERSION);
        assert_eq!(metadata["stores"], json!(["documentStore", "treeStore"]));
        assert_eq!(value["documentStore"]["bins"]["bin-1"]["fields"]["fill"], 40);
        assert_eq!(value["treeStore"]["status"], "ok");
    }

    #[test]
    fn test_reads_data_alias_and_null_tree() {
        let raw = json!({
            "metadata": {
                "backupId": "manual_2026-03-04T02-00-05-000Z",
                "type": "manual",
                "timestamp": "2026-03-04T02:00:05Z",
                "version": "1.0"
            },
            "documentStore": {"bins": {"a": {"data": {"fill": 1}}}},
            "treeStore": null
        });

        let artifact = BackupArtifact::from_json_bytes(raw.to_string().as_bytes()).unwrap();
        assert_eq!(artifact.tier(), BackupTier::Manual);
        assert_eq!(artifact.document_count(), 1);
        assert!(artifact.tree_store.is_none());
        assert!(artifact.metadata.stores.is_empty());
        assert_eq!(artifact.document_store.unwrap()["bins"]["a"].fields["fill"], 1);
    }
}
