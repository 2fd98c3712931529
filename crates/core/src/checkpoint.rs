//! Durable record of what has been offloaded.
//!
//! The checkpoint is the only state consulted on restart to decide which chunks are still owed.
//! It is written locally with an atomic replace and then mirrored to the remote store, so a fresh
//! machine can resume from the remote copy alone.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::atomic_file::{read_json, write_json_atomic};
use crate::batch::Batch;
use crate::store::{RemoteStore, RepoHandle, StoreError};
use crate::{Error, Result};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn utc_timestamp() -> String {
    chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub start: u32,
    pub end: u32,
    pub path: String,
}

impl ArchiveRecord {
    pub fn batch(&self) -> Batch {
        Batch::new(self.start, self.end)
    }
}

/// On-disk field names follow the `download_progress.json` layout existing deployments use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Highest index `f` with every chunk in `0..=f` uploaded; `-1` on disk when none is.
    #[serde(rename = "last_uploaded_piece", with = "frontier_repr")]
    pub frontier: Option<u32>,
    #[serde(rename = "downloaded_pieces")]
    pub uploaded: BTreeSet<u32>,
    pub timestamp: String,
    #[serde(rename = "total_pieces")]
    pub total_chunks: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub archives: Vec<ArchiveRecord>,
}

mod frontier_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<u32>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(f) => s.serialize_i64(i64::from(*f)),
            None => s.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        let raw = i64::deserialize(d)?;
        if raw < 0 {
            return Ok(None);
        }
        u32::try_from(raw)
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("frontier out of range: {raw}")))
    }
}

impl Checkpoint {
    pub fn new(total_chunks: u32) -> Self {
        Self {
            frontier: None,
            uploaded: BTreeSet::new(),
            timestamp: utc_timestamp(),
            total_chunks,
            archives: Vec::new(),
        }
    }

    pub fn compute_frontier(uploaded: &BTreeSet<u32>) -> Option<u32> {
        let mut frontier = None;
        for (expected, &index) in uploaded.iter().enumerate() {
            if index as usize != expected {
                break;
            }
            frontier = Some(index);
        }
        frontier
    }

    pub fn is_uploaded(&self, index: u32) -> bool {
        self.uploaded.contains(&index)
    }

    pub fn is_fully_uploaded(&self) -> bool {
        self.uploaded.len() as u64 == u64::from(self.total_chunks)
    }

    /// Makes the frontier and the uploaded set agree: every index up to a stated frontier counts
    /// as uploaded, and the frontier never sits below the contiguous prefix.
    pub fn normalize(&mut self) {
        if let Some(f) = self.frontier {
            self.uploaded.extend(0..=f.min(self.total_chunks.saturating_sub(1)));
        }
        self.uploaded.retain(|i| *i < self.total_chunks);
        let total = self.total_chunks;
        self.frontier = self
            .frontier
            .filter(|f| *f < total)
            .max(Self::compute_frontier(&self.uploaded));
        self.archives.sort();
        self.archives.dedup();
    }

    /// Records a confirmed upload of `batch` at `remote_path`.
    pub fn record_batch(&mut self, batch: Batch, remote_path: &str) {
        self.uploaded.extend(batch.indices());
        self.archives.push(ArchiveRecord {
            start: batch.start,
            end: batch.end,
            path: remote_path.to_string(),
        });
        self.normalize();
        self.timestamp = utc_timestamp();
    }

    /// Union of two checkpoints of the same content. Both sides only ever list confirmed uploads.
    pub fn merge(&mut self, other: &Checkpoint) {
        self.uploaded.extend(other.uploaded.iter().copied());
        self.archives.extend(other.archives.iter().cloned());
        self.frontier = self.frontier.max(other.frontier);
        if other.timestamp > self.timestamp {
            self.timestamp = other.timestamp.clone();
        }
        self.normalize();
    }
}

/// Reads a checkpoint file; `None` when it does not exist.
pub fn read_checkpoint(path: &Path) -> Result<Option<Checkpoint>> {
    match read_json::<Checkpoint>(path) {
        Ok(cp) => Ok(Some(cp)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

struct RemoteMirror {
    store: Arc<dyn RemoteStore>,
    repo: RepoHandle,
    remote_path: String,
}

pub struct CheckpointStore {
    local_path: PathBuf,
    remote: Option<RemoteMirror>,
    last_frontier: Option<u32>,
}

impl CheckpointStore {
    pub fn local_only(local_path: PathBuf) -> Self {
        Self {
            local_path,
            remote: None,
            last_frontier: None,
        }
    }

    pub fn with_remote(
        local_path: PathBuf,
        store: Arc<dyn RemoteStore>,
        repo: RepoHandle,
        remote_path: String,
    ) -> Self {
        Self {
            local_path,
            remote: Some(RemoteMirror {
                store,
                repo,
                remote_path,
            }),
            last_frontier: None,
        }
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn last_frontier(&self) -> Option<u32> {
        self.last_frontier
    }

    /// Loads the remote copy (preferred) and reconciles it with the local one.
    ///
    /// When the two disagree on the chunk count, the copy matching `expected_total` wins, and the
    /// remote one otherwise. Unreadable copies are logged and treated as absent.
    pub async fn load(&mut self, expected_total: Option<u32>) -> Result<Option<Checkpoint>> {
        let local = match read_checkpoint(&self.local_path) {
            Ok(cp) => cp,
            Err(e) => {
                tracing::warn!(
                    event = "checkpoint.local_unreadable",
                    path = %self.local_path.display(),
                    error = %e,
                    "local checkpoint ignored"
                );
                None
            }
        };
        let remote = self.load_remote().await;

        let mut loaded = match (remote, local) {
            (Some(mut remote), Some(local)) if remote.total_chunks == local.total_chunks => {
                remote.merge(&local);
                Some(remote)
            }
            (Some(remote), Some(local)) => {
                let use_local = expected_total.is_some_and(|t| {
                    local.total_chunks == t && remote.total_chunks != t
                });
                tracing::warn!(
                    event = "checkpoint.total_mismatch",
                    remote_total = remote.total_chunks,
                    local_total = local.total_chunks,
                    expected_total = ?expected_total,
                    using = if use_local { "local" } else { "remote" },
                    "remote and local checkpoints disagree on total chunks"
                );
                Some(if use_local { local } else { remote })
            }
            (Some(remote), None) => Some(remote),
            (None, local) => local,
        };

        if let Some(cp) = loaded.as_mut() {
            cp.normalize();
            self.last_frontier = self.last_frontier.max(cp.frontier);
            tracing::info!(
                event = "checkpoint.loaded",
                frontier = ?cp.frontier,
                uploaded = cp.uploaded.len(),
                total_chunks = cp.total_chunks,
                "checkpoint loaded"
            );
        }
        Ok(loaded)
    }

    async fn load_remote(&self) -> Option<Checkpoint> {
        let mirror = self.remote.as_ref()?;
        let bytes = match mirror
            .store
            .download_artifact(&mirror.repo, &mirror.remote_path)
            .await
        {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound { .. }) => return None,
            Err(e) => {
                tracing::warn!(
                    event = "checkpoint.remote_unavailable",
                    error = %e,
                    "remote checkpoint could not be fetched"
                );
                return None;
            }
        };
        match serde_json::from_slice::<Checkpoint>(&bytes) {
            Ok(cp) => Some(cp),
            Err(e) => {
                tracing::warn!(
                    event = "checkpoint.remote_unreadable",
                    error = %e,
                    "remote checkpoint ignored"
                );
                None
            }
        }
    }

    /// Writes the checkpoint locally, then mirrors it to the remote store.
    ///
    /// A frontier lower than the last saved one is refused and nothing is written. Mirror
    /// failures are logged only.
    pub async fn save(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        if checkpoint.frontier < self.last_frontier {
            return Err(Error::FrontierRegression {
                previous: self.last_frontier,
                next: checkpoint.frontier,
            });
        }

        let path = self.local_path.clone();
        let value = checkpoint.clone();
        tokio::task::spawn_blocking(move || write_json_atomic(&path, &value))
            .await
            .map_err(std::io::Error::other)??;
        self.last_frontier = checkpoint.frontier;

        if let Some(mirror) = self.remote.as_ref()
            && let Err(e) = mirror
                .store
                .upload_artifact(&mirror.repo, &self.local_path, &mirror.remote_path)
                .await
        {
            tracing::warn!(
                event = "checkpoint.mirror_failed",
                remote_path = %mirror.remote_path,
                error = %e,
                "checkpoint mirror failed; local copy is current"
            );
        }

        tracing::debug!(
            event = "checkpoint.saved",
            frontier = ?checkpoint.frontier,
            uploaded = checkpoint.uploaded.len(),
            "checkpoint saved"
        );
        Ok(())
    }
}
