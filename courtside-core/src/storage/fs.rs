use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courtside_model::{Checkpoint, ListingEntry, TaskKey};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use super::{
    ArtifactMetadata, CheckpointStore, SinkError, StorageListing, StorageSink,
    validate_path,
};

/// Suffix of the metadata file written next to each artifact.
pub const SIDECAR_SUFFIX: &str = ".meta.json";

/// Artifact store rooted at a local directory. Writes go to a temporary
/// file that is renamed into place, so readers never see partial content.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

#[derive(Serialize)]
struct Sidecar<'a> {
    #[serde(flatten)]
    metadata: &'a ArtifactMetadata,
    size: u64,
    sha256: String,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), SinkError> {
    let display = target.display().to_string();
    let parent = target
        .parent()
        .ok_or_else(|| SinkError::Fatal(format!("{display} has no parent")))?;
    fs::create_dir_all(parent)
        .await
        .map_err(|err| SinkError::from_io(err, &display))?;

    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{file_name}.{}.tmp", Uuid::now_v7()));

    if let Err(err) = fs::write(&tmp, bytes).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(SinkError::from_io(err, &display));
    }
    if let Err(err) = fs::rename(&tmp, target).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(SinkError::from_io(err, &display));
    }
    Ok(())
}

fn is_hidden_or_sidecar(name: &str) -> bool {
    name.starts_with('.') || name.ends_with(SIDECAR_SUFFIX)
}

#[async_trait]
impl StorageSink for FsStorage {
    async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        metadata: &ArtifactMetadata,
    ) -> Result<(), SinkError> {
        validate_path(path)?;
        let target = self.root.join(path);
        write_atomic(&target, bytes).await?;

        let sidecar = Sidecar {
            metadata,
            size: bytes.len() as u64,
            sha256: format!("{:x}", Sha256::digest(bytes)),
        };
        let encoded = serde_json::to_vec_pretty(&sidecar)
            .map_err(|err| SinkError::Fatal(format!("encode metadata: {err}")))?;
        let sidecar_path = self.root.join(format!("{path}{SIDECAR_SUFFIX}"));
        write_atomic(&sidecar_path, &encoded).await
    }
}

#[async_trait]
impl StorageListing for FsStorage {
    async fn list(&self, prefix: &str) -> Result<Vec<ListingEntry>, SinkError> {
        // Only walk the deepest directory the prefix names.
        let dir = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = self.root.join(dir);
        let mut entries = Vec::new();
        let mut pending = vec![(start, dir.to_string())];

        while let Some((path, relative)) = pending.pop() {
            let mut read_dir = match fs::read_dir(&path).await {
                Ok(read_dir) => read_dir,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(SinkError::from_io(err, &path.display().to_string()));
                }
            };

            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|err| SinkError::from_io(err, &path.display().to_string()))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if is_hidden_or_sidecar(&name) {
                    continue;
                }
                let child = if relative.is_empty() {
                    name
                } else {
                    format!("{relative}/{name}")
                };
                let meta = entry.metadata().await.map_err(|err| {
                    SinkError::from_io(err, &entry.path().display().to_string())
                })?;

                if meta.is_dir() {
                    let reachable =
                        child.starts_with(prefix) || prefix.starts_with(&child);
                    if reachable {
                        pending.push((entry.path(), child));
                    }
                } else if meta.is_file() && child.starts_with(prefix) {
                    let last_modified = meta
                        .modified()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now());
                    entries.push(ListingEntry {
                        path: child,
                        size: meta.len(),
                        last_modified,
                    });
                }
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

/// Checkpoints as one JSON file per (data type, partition).
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    dir: PathBuf,
}

impl FsCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &TaskKey) -> PathBuf {
        let raw = key.to_string();
        let readable: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '=') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let digest = format!("{:x}", Sha256::digest(raw.as_bytes()));
        self.dir.join(format!("{readable}-{}.json", &digest[..12]))
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn load(&self, key: &TaskKey) -> Result<Option<Checkpoint>, SinkError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(err) => {
                return Err(SinkError::from_io(err, &path.display().to_string()));
            }
        };
        match serde_json::from_slice::<Checkpoint>(&bytes) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(err) => {
                // A torn or hand-edited file only costs a restart of the
                // partition.
                tracing::warn!(
                    target: "courtside::executor",
                    path = %path.display(),
                    error = %err,
                    "discarding unreadable checkpoint"
                );
                Ok(None)
            }
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), SinkError> {
        let encoded = serde_json::to_vec_pretty(checkpoint)
            .map_err(|err| SinkError::Fatal(format!("encode checkpoint: {err}")))?;
        write_atomic(&self.path_for(&checkpoint.key()), &encoded).await
    }

    async fn delete(&self, key: &TaskKey) -> Result<(), SinkError> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SinkError::from_io(err, &path.display().to_string())),
        }
    }
}
