//! Storage contracts consumed by reconciliation and the executor, with a
//! filesystem adapter and in-memory doubles.

use std::io;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courtside_model::{
    Checkpoint, DataTypeId, ListingEntry, PartitionKey, SourceId, SubUnitId,
    TaskKey,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod fs;
mod memory;

pub use fs::{FsCheckpointStore, FsStorage, SIDECAR_SUFFIX};
pub use memory::{MemoryCheckpointStore, MemoryStorage, StoredObject};

/// Storage failures split by whether retrying can help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Network blips, contention, interrupted writes.
    #[error("transient storage error: {0}")]
    Transient(String),
    /// Permission or configuration problems. Never retried.
    #[error("fatal storage error: {0}")]
    Fatal(String),
}

impl SinkError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SinkError::Fatal(_))
    }

    /// Classifies an IO error raised while touching `context`.
    pub fn from_io(err: io::Error, context: &str) -> Self {
        use io::ErrorKind::*;
        let message = format!("{context}: {err}");
        match err.kind() {
            PermissionDenied | ReadOnlyFilesystem | InvalidInput
            | NotADirectory | IsADirectory | StorageFull | Unsupported => {
                SinkError::Fatal(message)
            }
            _ => SinkError::Transient(message),
        }
    }
}

/// Provenance stored next to every artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub source: SourceId,
    pub data_type: DataTypeId,
    pub partition: PartitionKey,
    pub sub_unit: SubUnitId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Enumerates what has been persisted.
#[async_trait]
pub trait StorageListing: Send + Sync {
    /// Every artifact whose path starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ListingEntry>, SinkError>;
}

/// Idempotent artifact persistence: writing the same path twice leaves
/// one artifact with the latest bytes.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        metadata: &ArtifactMetadata,
    ) -> Result<(), SinkError>;
}

/// Persists checkpoints by (data type, partition).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, key: &TaskKey) -> Result<Option<Checkpoint>, SinkError>;

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), SinkError>;

    /// Removing a missing checkpoint is not an error.
    async fn delete(&self, key: &TaskKey) -> Result<(), SinkError>;
}

/// Rejects paths that would escape the storage root.
pub(crate) fn validate_path(path: &str) -> Result<(), SinkError> {
    let escapes = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if escapes {
        return Err(SinkError::Fatal(format!(
            "invalid artifact path {path:?}"
        )));
    }
    Ok(())
}
