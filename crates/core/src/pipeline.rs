//! One offload cycle: stage owed chunks, seal contiguous runs, upload, checkpoint.
//!
//! Local layout under the data directory:
//!
//! - `staging/chunk_{index:08}.dat`: chunks copied out of the engine, not yet sealed
//! - `archives/batch_{start:08}_{end:08}.pack`: sealed batches awaiting upload
//! - `<checkpoint_name>`: local checkpoint copy
//!
//! A chunk is owed while the engine has it, the checkpoint does not list it as uploaded and it is
//! neither staged nor inside a sealed archive. Every available chunk is always in exactly one of
//! those places, so nothing is lost across a crash and nothing confirmed is uploaded twice.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::archive::Compression;
use crate::atomic_file::is_temp_file_name;
use crate::batch::{Batch, BatchBuilder, SealedBatch, archive_path, parse_archive_name};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::engine::{ContentInfo, TransferEngine};
use crate::stager::{ChunkStager, StageError, parse_staged_chunk_name, staged_chunk_path};
use crate::store::{RemoteStore, RepoHandle};
use crate::uploader::{RetryPolicy, UploadFailure, Uploader};
use crate::{Error, Result};

pub const STAGING_DIR: &str = "staging";
pub const ARCHIVE_DIR: &str = "archives";

#[derive(Debug, Clone)]
pub struct OffloadSettings {
    pub upload_interval: Duration,
    pub status_interval: Duration,
    pub retry: RetryPolicy,
    pub chunk_read_timeout: Duration,
    pub max_batch_chunks: Option<u32>,
    pub compression: Compression,
    pub repository: String,
    pub remote_prefix: String,
    pub checkpoint_name: String,
}

impl Default for OffloadSettings {
    fn default() -> Self {
        Self {
            upload_interval: Duration::from_secs(60),
            status_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            chunk_read_timeout: Duration::from_secs(10),
            max_batch_chunks: None,
            compression: Compression::None,
            repository: "chunkferry".to_string(),
            remote_prefix: "pieces".to_string(),
            checkpoint_name: "download_progress.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub staged: usize,
    pub stage_failures: usize,
    pub sealed: Vec<Batch>,
    pub seal_failures: usize,
    pub uploaded: Vec<Batch>,
    pub abandoned: Vec<Batch>,
    pub frontier: Option<u32>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub temp_removed: usize,
    pub stale_removed: usize,
    pub staged_adopted: usize,
    pub archives_adopted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Teardown {
    Removed,
    /// Local artifacts kept because they are not uploaded yet, or the checkpoint that records
    /// them is not saved yet.
    Kept {
        staged: Vec<u32>,
        pending: Vec<Batch>,
        missing: Vec<u32>,
    },
}

pub struct OffloadPipeline {
    engine: Arc<dyn TransferEngine>,
    info: ContentInfo,
    staging_dir: PathBuf,
    archive_dir: PathBuf,
    stager: ChunkStager,
    builder: BatchBuilder,
    uploader: Uploader,
    checkpoints: CheckpointStore,
    checkpoint: Checkpoint,
    staged: BTreeSet<u32>,
    pending: BTreeMap<Batch, SealedBatch>,
    /// The in-memory checkpoint is ahead of the last successful save.
    checkpoint_dirty: bool,
}

fn setup_err(what: &str, path: &Path, e: impl std::fmt::Display) -> Error {
    Error::Setup {
        message: format!("{what} {}: {e}", path.display()),
    }
}

impl OffloadPipeline {
    /// Prepares local directories, loads and reconciles the checkpoint, and recovers whatever an
    /// earlier run left on disk.
    pub async fn open(
        engine: Arc<dyn TransferEngine>,
        store: Arc<dyn RemoteStore>,
        repo: RepoHandle,
        settings: &OffloadSettings,
        data_dir: &Path,
        info: ContentInfo,
    ) -> Result<Self> {
        let staging_dir = data_dir.join(STAGING_DIR);
        let archive_dir = data_dir.join(ARCHIVE_DIR);
        for dir in [&staging_dir, &archive_dir] {
            std::fs::create_dir_all(dir).map_err(|e| setup_err("create", dir, e))?;
        }

        let mut checkpoints = CheckpointStore::with_remote(
            data_dir.join(&settings.checkpoint_name),
            Arc::clone(&store),
            repo.clone(),
            settings.checkpoint_name.clone(),
        );
        let checkpoint = match checkpoints.load(Some(info.total_chunks)).await? {
            Some(cp) if cp.total_chunks != info.total_chunks => {
                return Err(Error::Setup {
                    message: format!(
                        "checkpoint is for {} chunks but content has {}",
                        cp.total_chunks, info.total_chunks
                    ),
                });
            }
            Some(cp) => cp,
            None => Checkpoint::new(info.total_chunks),
        };

        let mut pipeline = Self {
            stager: ChunkStager::new(
                Arc::clone(&engine),
                staging_dir.clone(),
                settings.chunk_read_timeout,
            ),
            builder: BatchBuilder::new(
                staging_dir.clone(),
                archive_dir.clone(),
                info.chunk_size,
                settings.compression,
                settings.max_batch_chunks,
            ),
            uploader: Uploader::new(store, repo, settings.remote_prefix.clone(), settings.retry),
            engine,
            info,
            staging_dir,
            archive_dir,
            checkpoints,
            checkpoint,
            staged: BTreeSet::new(),
            pending: BTreeMap::new(),
            checkpoint_dirty: false,
        };

        let recovered = pipeline.recover()?;
        tracing::info!(
            event = "offload.recovered",
            temp_removed = recovered.temp_removed,
            stale_removed = recovered.stale_removed,
            staged = recovered.staged_adopted,
            archives = recovered.archives_adopted,
            frontier = ?pipeline.checkpoint.frontier,
            "local state recovered"
        );

        let uploaded: Vec<u32> = pipeline.checkpoint.uploaded.iter().copied().collect();
        if !uploaded.is_empty() {
            pipeline.engine.skip_chunks(&uploaded);
        }
        Ok(pipeline)
    }

    fn recover(&mut self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for (name, path) in list_dir(&self.archive_dir)? {
            if is_temp_file_name(&name) {
                remove_quietly(&path);
                report.temp_removed += 1;
                continue;
            }
            let Some(batch) = parse_archive_name(&name) else {
                continue;
            };
            let any_uploaded = batch.indices().any(|i| self.checkpoint.is_uploaded(i));
            if any_uploaded || batch.end >= self.info.total_chunks {
                // Fully uploaded, or overlapping confirmed chunks: uploading it again would
                // duplicate them. Whatever is still owed gets re-read from the engine.
                remove_quietly(&path);
                report.stale_removed += 1;
                continue;
            }
            self.pending.insert(batch, SealedBatch { batch, path });
            report.archives_adopted += 1;
        }

        for (name, path) in list_dir(&self.staging_dir)? {
            if is_temp_file_name(&name) {
                remove_quietly(&path);
                report.temp_removed += 1;
                continue;
            }
            let Some(index) = parse_staged_chunk_name(&name) else {
                continue;
            };
            let sealed = self.pending.keys().any(|b| b.contains(index));
            if sealed || self.checkpoint.is_uploaded(index) || index >= self.info.total_chunks {
                remove_quietly(&path);
                report.stale_removed += 1;
                continue;
            }
            self.staged.insert(index);
            report.staged_adopted += 1;
        }

        Ok(report)
    }

    pub fn content_info(&self) -> &ContentInfo {
        &self.info
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn staged(&self) -> &BTreeSet<u32> {
        &self.staged
    }

    pub fn pending_batches(&self) -> Vec<Batch> {
        self.pending.keys().copied().collect()
    }

    pub fn is_drained(&self) -> bool {
        self.staged.is_empty() && self.pending.is_empty()
    }

    pub fn is_checkpoint_dirty(&self) -> bool {
        self.checkpoint_dirty
    }

    /// Every chunk is uploaded and the checkpoint recording that is saved.
    pub fn is_finished(&self) -> bool {
        self.is_drained() && self.checkpoint.is_fully_uploaded() && !self.checkpoint_dirty
    }

    fn is_owed(&self, index: u32) -> bool {
        !self.checkpoint.is_uploaded(index)
            && !self.staged.contains(&index)
            && !self.pending.keys().any(|b| b.contains(index))
            && self.engine.is_available(index)
    }

    /// Chunks the engine has that are neither uploaded nor already in the pipeline.
    pub fn owed_indices(&self) -> Vec<u32> {
        (0..self.info.total_chunks)
            .filter(|i| self.is_owed(*i))
            .collect()
    }

    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::default();
        if self.checkpoint_dirty {
            self.save_checkpoint().await;
        }
        let owed = self.owed_indices();
        tracing::info!(
            event = "offload.cycle.start",
            owed = owed.len(),
            staged = self.staged.len(),
            pending = self.pending.len(),
            frontier = ?self.checkpoint.frontier,
            "offload cycle started"
        );

        for index in owed {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.stager.stage(index).await {
                Ok(_) => {
                    self.staged.insert(index);
                    report.staged += 1;
                }
                Err(StageError::Timeout { index }) => {
                    report.stage_failures += 1;
                    tracing::warn!(event = "stage.timeout", index, "chunk read timed out");
                }
                Err(e) => {
                    report.stage_failures += 1;
                    tracing::warn!(event = "stage.failed", index, error = %e, "chunk not staged");
                }
            }
        }

        if !report.cancelled {
            self.seal_staged(&mut report).await;
            self.upload_pending(cancel, &mut report).await;
        }

        if self.checkpoint_dirty {
            self.save_checkpoint().await;
        }

        report.frontier = self.checkpoint.frontier;
        tracing::info!(
            event = "offload.cycle.done",
            staged = report.staged,
            sealed = report.sealed.len(),
            uploaded = report.uploaded.len(),
            abandoned = report.abandoned.len(),
            pending = self.pending.len(),
            frontier = ?report.frontier,
            cancelled = report.cancelled,
            "offload cycle finished"
        );
        report
    }

    async fn seal_staged(&mut self, report: &mut CycleReport) {
        for batch in self.builder.build(&self.staged) {
            let builder = self.builder.clone();
            let sealed = tokio::task::spawn_blocking(move || builder.seal(batch))
                .await
                .unwrap_or_else(|e| {
                    Err(Error::Archive {
                        message: format!("seal task failed: {e}"),
                    })
                });
            match sealed {
                Ok(sealed) => {
                    for index in batch.indices() {
                        self.staged.remove(&index);
                    }
                    self.pending.insert(batch, sealed);
                    report.sealed.push(batch);
                }
                Err(e) => {
                    report.seal_failures += 1;
                    tracing::warn!(
                        event = "batch.seal_failed",
                        batch = %batch,
                        error = %e,
                        "batch not sealed; chunks stay staged"
                    );
                }
            }
        }
    }

    async fn upload_pending(&mut self, cancel: &CancellationToken, report: &mut CycleReport) {
        let pending: Vec<SealedBatch> = self.pending.values().cloned().collect();
        for sealed in pending {
            match self.uploader.upload(&sealed, cancel).await {
                Ok(remote_path) => {
                    self.pending.remove(&sealed.batch);
                    self.checkpoint.record_batch(sealed.batch, &remote_path);
                    report.uploaded.push(sealed.batch);
                    self.save_checkpoint().await;
                }
                Err(UploadFailure::Exhausted { .. }) => {
                    report.abandoned.push(sealed.batch);
                }
                Err(UploadFailure::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
            }
        }
    }

    /// Saves the in-memory checkpoint. A failure leaves it marked dirty so the next cycle
    /// writes it again.
    pub async fn flush_checkpoint(&mut self) -> Result<()> {
        let saved = self.checkpoints.save(&self.checkpoint).await;
        self.checkpoint_dirty = saved.is_err();
        saved
    }

    async fn save_checkpoint(&mut self) {
        if let Err(e) = self.flush_checkpoint().await {
            tracing::error!(
                event = "checkpoint.save_failed",
                frontier = ?self.checkpoint.frontier,
                error = %e,
                "checkpoint not saved; retrying next cycle"
            );
        }
    }

    /// Removes the staging and archive directories once everything is uploaded and recorded.
    pub fn teardown(&self) -> Result<Teardown> {
        if !self.is_finished() {
            let staged: Vec<u32> = self.staged.iter().copied().collect();
            let pending = self.pending_batches();
            let missing: Vec<u32> = (0..self.info.total_chunks)
                .filter(|i| !self.checkpoint.is_uploaded(*i))
                .collect();
            tracing::warn!(
                event = "offload.teardown_skipped",
                staged = staged.len(),
                pending = pending.len(),
                missing = missing.len(),
                checkpoint_dirty = self.checkpoint_dirty,
                "local artifacts kept; not everything is uploaded and recorded"
            );
            return Ok(Teardown::Kept {
                staged,
                pending,
                missing,
            });
        }
        for dir in [&self.staging_dir, &self.archive_dir] {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        tracing::info!(event = "offload.teardown", "local staging removed");
        Ok(Teardown::Removed)
    }

    pub fn staged_path(&self, index: u32) -> PathBuf {
        staged_chunk_path(&self.staging_dir, index)
    }

    pub fn archive_path(&self, batch: Batch) -> PathBuf {
        archive_path(&self.archive_dir, batch)
    }
}

fn list_dir(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        out.push((entry.file_name().to_string_lossy().to_string(), entry.path()));
    }
    out.sort();
    Ok(out)
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(
            event = "offload.cleanup_failed",
            path = %path.display(),
            error = %e,
            "failed to remove leftover file"
        );
    }
}
