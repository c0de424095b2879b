use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courtside_model::{Checkpoint, ListingEntry, TaskKey};

use super::{
    ArtifactMetadata, CheckpointStore, SinkError, StorageListing, StorageSink,
    validate_path,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An artifact held by [`MemoryStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub metadata: Option<ArtifactMetadata>,
    pub last_modified: DateTime<Utc>,
}

/// In-memory artifact store for tests and dry runs. Failures can be queued
/// to exercise retry paths.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    injected: Mutex<VecDeque<SinkError>>,
    puts: Mutex<u64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an object as if it had been written at `last_modified`.
    pub fn insert(&self, path: impl Into<String>, bytes: &[u8], last_modified: DateTime<Utc>) {
        lock(&self.objects).insert(
            path.into(),
            StoredObject {
                bytes: bytes.to_vec(),
                metadata: None,
                last_modified,
            },
        );
    }

    /// The next `put` calls fail with these errors, in order.
    pub fn fail_next_puts(&self, errors: impl IntoIterator<Item = SinkError>) {
        lock(&self.injected).extend(errors);
    }

    pub fn get(&self, path: &str) -> Option<StoredObject> {
        lock(&self.objects).get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempted writes, failed ones included.
    pub fn put_count(&self) -> u64 {
        *lock(&self.puts)
    }
}

#[async_trait]
impl StorageSink for MemoryStorage {
    async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        metadata: &ArtifactMetadata,
    ) -> Result<(), SinkError> {
        *lock(&self.puts) += 1;
        validate_path(path)?;
        if let Some(err) = lock(&self.injected).pop_front() {
            return Err(err);
        }
        lock(&self.objects).insert(
            path.to_string(),
            StoredObject {
                bytes: bytes.to_vec(),
                metadata: Some(metadata.clone()),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl StorageListing for MemoryStorage {
    async fn list(&self, prefix: &str) -> Result<Vec<ListingEntry>, SinkError> {
        Ok(lock(&self.objects)
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, object)| ListingEntry {
                path: path.clone(),
                size: object.bytes.len() as u64,
                last_modified: object.last_modified,
            })
            .collect())
    }
}

/// In-memory checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<TaskKey, Checkpoint>>,
    saves: Mutex<u64>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &TaskKey) -> Option<Checkpoint> {
        lock(&self.checkpoints).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.checkpoints).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn save_count(&self) -> u64 {
        *lock(&self.saves)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, key: &TaskKey) -> Result<Option<Checkpoint>, SinkError> {
        Ok(self.get(key))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), SinkError> {
        *lock(&self.saves) += 1;
        lock(&self.checkpoints).insert(checkpoint.key(), checkpoint.clone());
        Ok(())
    }

    async fn delete(&self, key: &TaskKey) -> Result<(), SinkError> {
        lock(&self.checkpoints).remove(key);
        Ok(())
    }
}
