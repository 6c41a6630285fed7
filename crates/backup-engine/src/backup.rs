/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Snapshot export from the live stores

use crate::{
    artifact::{BackupArtifact, BackupTier, CollectionDataset, DocumentDataset, DocumentRecord},
    error::{BackupError, Result},
    source::{SourceStores, StoreKind},
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

/// Walks both stores and assembles an in-memory [`BackupArtifact`]
#[derive(Debug, Clone)]
pub struct SnapshotExporter {
    stores: SourceStores,
}

impl SnapshotExporter {
    pub fn new(stores: SourceStores) -> Self {
        Self { stores }
    }

    /// Capture a full snapshot for `tier`
    pub async fn export(&self, tier: BackupTier) -> Result<BackupArtifact> {
        self.export_at(tier, Utc::now()).await
    }

    /// Capture a full snapshot stamped with `created_at`.
    ///
    /// Fails on the first store read error; partial datasets are never
    /// returned.
    pub async fn export_at(
        &self,
        tier: BackupTier,
        created_at: DateTime<Utc>,
    ) -> Result<BackupArtifact> {
        let start_time = std::time::Instant::now();
        let _lease = self.stores.lease.shared().await;

        let documents = self.export_documents().await?;
        let tree = self.export_tree().await?;

        let artifact = BackupArtifact::new(tier, created_at, Some(documents), tree);

        let duration = start_time.elapsed();
        metrics::histogram!("backup_export_duration_seconds", "tier" => tier.as_str())
            .record(duration.as_secs_f64());
        info!(
            "Exported {} snapshot {} ({} collections, {} documents) in {:.2}s",
            tier,
            artifact.id(),
            artifact.document_store.as_ref().map(|d| d.len()).unwrap_or(0),
            artifact.document_count(),
            duration.as_secs_f64()
        );

        Ok(artifact)
    }

    async fn export_documents(&self) -> Result<DocumentDataset> {
        let documents = &self.stores.documents;
        let collections = documents
            .list_collections()
            .await
            .map_err(|source| BackupError::SourceRead {
                store: StoreKind::DocumentStore,
                source: source.context("listing collections"),
            })?;

        let mut dataset = DocumentDataset::new();
        for collection in collections {
            let stored = documents
                .list_documents(&collection)
                .await
                .map_err(|source| BackupError::SourceRead {
                    store: StoreKind::DocumentStore,
                    source: source.context(format!("listing collection {}", collection)),
                })?;

            debug!("Captured {} documents from {}", stored.len(), collection);

            let records: CollectionDataset = stored
                .into_iter()
                .map(|document| {
                    (
                        document.id,
                        DocumentRecord {
                            fields: document.fields,
                            create_time: document.create_time,
                            update_time: document.update_time,
                        },
                    )
                })
                .collect();
            dataset.insert(collection, records);
        }

        Ok(dataset)
    }

    async fn export_tree(&self) -> Result<Option<Value>> {
        let root = self
            .stores
            .tree
            .read_root()
            .await
            .map_err(|source| BackupError::SourceRead {
                store: StoreKind::TreeStore,
                source,
            })?;

        Ok(match root {
            Value::Null => None,
            value => Some(value),
        })
    }
}
