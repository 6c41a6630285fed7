/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Live store adapters that backups are taken from and restored into

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Hard per-commit write limit of the document store
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

/// Which live store an operation touched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreKind {
    DocumentStore,
    TreeStore,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::DocumentStore => f.write_str("document store"),
            StoreKind::TreeStore => f.write_str("tree store"),
        }
    }
}

/// A document as enumerated from the document store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub fields: Map<String, Value>,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

/// A single pending write issued during restore
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWrite {
    pub collection: String,
    pub id: String,
    pub fields: Map<String, Value>,
}

/// Collection-of-documents store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Names of every top-level collection
    async fn list_collections(&self) -> anyhow::Result<Vec<String>>;

    /// Every document in a collection
    async fn list_documents(&self, collection: &str) -> anyhow::Result<Vec<StoredDocument>>;

    /// Commit a batch of writes atomically. Never called with more than
    /// `max_batch_size()` writes.
    async fn commit_batch(&self, writes: Vec<DocumentWrite>) -> anyhow::Result<()>;

    fn max_batch_size(&self) -> usize {
        DEFAULT_MAX_BATCH_SIZE
    }
}

/// Single-root hierarchical store
#[async_trait]
pub trait TreeStore: Send + Sync {
    /// Whole tree, `Value::Null` when empty
    async fn read_root(&self) -> anyhow::Result<Value>;

    /// Replace the whole tree
    async fn write_root(&self, value: Value) -> anyhow::Result<()>;
}

/// Advisory lease serializing exports against restores.
///
/// Exports and dry runs hold it shared; a restore that writes holds it
/// exclusively, so a scheduled backup never captures a half-restored state.
#[derive(Debug, Clone, Default)]
pub struct StoreLease(Arc<RwLock<()>>);

impl StoreLease {
    pub async fn shared(&self) -> OwnedRwLockReadGuard<()> {
        self.0.clone().read_owned().await
    }

    pub async fn exclusive(&self) -> OwnedRwLockWriteGuard<()> {
        self.0.clone().write_owned().await
    }
}

/// The pair of live stores plus the lease coordinating access to them
#[derive(Clone)]
pub struct SourceStores {
    pub documents: Arc<dyn DocumentStore>,
    pub tree: Arc<dyn TreeStore>,
    pub lease: StoreLease,
}

impl SourceStores {
    pub fn new(documents: Arc<dyn DocumentStore>, tree: Arc<dyn TreeStore>) -> Self {
        Self {
            documents,
            tree,
            lease: StoreLease::default(),
        }
    }
}

impl fmt::Debug for SourceStores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceStores").finish_non_exhaustive()
    }
}

/// In-memory document store
#[derive(Debug)]
pub struct MemoryDocumentStore {
    collections: RwLock<BTreeMap<String, BTreeMap<String, StoredDocument>>>,
    max_batch_size: usize,
    batches_committed: AtomicUsize,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::with_batch_limit(DEFAULT_MAX_BATCH_SIZE)
    }

    pub fn with_batch_limit(max_batch_size: usize) -> Self {
        Self {
            collections: RwLock::new(BTreeMap::new()),
            max_batch_size,
            batches_committed: AtomicUsize::new(0),
        }
    }

    /// Insert or replace a document
    pub async fn insert(&self, collection: &str, id: &str, fields: Map<String, Value>) {
        let now = Utc::now();
        let mut collections = self.collections.write().await;
        let documents = collections.entry(collection.to_string()).or_default();
        let create_time = documents
            .get(id)
            .and_then(|existing| existing.create_time)
            .unwrap_or(now);
        documents.insert(
            id.to_string(),
            StoredDocument {
                id: id.to_string(),
                fields,
                create_time: Some(create_time),
                update_time: Some(now),
            },
        );
    }

    pub async fn get(&self, collection: &str, id: &str) -> Option<StoredDocument> {
        self.collections
            .read()
            .await
            .get(collection)
            .and_then(|documents| documents.get(id))
            .cloned()
    }

    pub async fn document_count(&self) -> usize {
        self.collections.read().await.values().map(|d| d.len()).sum()
    }

    pub async fn clear(&self) {
        self.collections.write().await.clear();
    }

    /// Number of batches committed since creation
    pub fn batches_committed(&self) -> usize {
        self.batches_committed.load(Ordering::SeqCst)
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn list_collections(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.collections.read().await.keys().cloned().collect())
    }

    async fn list_documents(&self, collection: &str) -> anyhow::Result<Vec<StoredDocument>> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|documents| documents.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn commit_batch(&self, writes: Vec<DocumentWrite>) -> anyhow::Result<()> {
        if writes.len() > self.max_batch_size {
            anyhow::bail!(
                "batch of {} writes exceeds the limit of {}",
                writes.len(),
                self.max_batch_size
            );
        }

        for write in writes {
            self.insert(&write.collection, &write.id, write.fields).await;
        }
        self.batches_committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

/// In-memory tree store
#[derive(Debug, Default)]
pub struct MemoryTreeStore {
    root: RwLock<Value>,
    writes: AtomicUsize,
}

impl MemoryTreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, value: Value) {
        *self.root.write().await = value;
    }

    pub async fn get(&self) -> Value {
        self.root.read().await.clone()
    }

    pub async fn clear(&self) {
        *self.root.write().await = Value::Null;
    }

    /// Number of `write_root` calls received
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TreeStore for MemoryTreeStore {
    async fn read_root(&self) -> anyhow::Result<Value> {
        Ok(self.root.read().await.clone())
    }

    async fn write_root(&self, value: Value) -> anyhow::Result<()> {
        *self.root.write().await = value;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
