/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Error types for backup and restore operations

use crate::{restore::RestoreResult, source::StoreKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Backup-specific errors
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    CompressionError(String),

    #[error("Failed to read {store}: {source:#}")]
    SourceRead {
        store: StoreKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid schedule: {0}")]
    ScheduleError(String),

    #[error("Invalid backup format: {0}")]
    InvalidFormat(String),

    #[error("Backup {0} already exists")]
    AlreadyExists(String),
}

impl BackupError {
    pub(crate) fn join(err: tokio::task::JoinError) -> Self {
        BackupError::IoError(std::io::Error::other(err))
    }
}

/// A store whose restore phase failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFailure {
    pub store: StoreKind,
    pub cause: String,
}

/// Restore-specific errors
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Backup error: {0}")]
    BackupError(#[from] BackupError),

    #[error("Backup {id} cannot be restored: {reason}")]
    ArtifactUnavailable { id: String, reason: String },

    #[error("Backup {id} failed validation: {reason}")]
    InvalidArtifact { id: String, reason: String },

    #[error("Restore failed: {}", describe_failures(.failures))]
    StoreFailed {
        failures: Vec<StoreFailure>,
        outcome: Box<RestoreResult>,
    },
}

fn describe_failures(failures: &[StoreFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{} ({})", failure.store, failure.cause))
        .collect::<Vec<_>>()
        .join("; ")
}
