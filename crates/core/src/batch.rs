use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::archive::{ArchiveWriter, Compression};
use crate::stager::staged_chunk_path;
use crate::{Error, Result};

/// Inclusive run of consecutive chunk indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Batch {
    pub start: u32,
    pub end: u32,
}

impl Batch {
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn chunk_count(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn contains(&self, index: u32) -> bool {
        (self.start..=self.end).contains(&index)
    }

    pub fn indices(&self) -> std::ops::RangeInclusive<u32> {
        self.start..=self.end
    }

    pub fn name(&self) -> String {
        format!("batch_{:08}_{:08}.pack", self.start, self.end)
    }
}

impl std::fmt::Display for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

pub fn archive_path(archive_dir: &Path, batch: Batch) -> PathBuf {
    archive_dir.join(batch.name())
}

pub fn parse_archive_name(name: &str) -> Option<Batch> {
    let rest = name.strip_prefix("batch_")?.strip_suffix(".pack")?;
    let (start, end) = rest.split_once('_')?;
    let start: u32 = start.parse().ok()?;
    let end: u32 = end.parse().ok()?;
    (start <= end).then_some(Batch { start, end })
}

/// Groups indices into maximal contiguous runs, ascending by start. With `max_chunks`, long runs
/// are cut into consecutive runs of at most that many chunks.
pub fn build_batches(staged: &BTreeSet<u32>, max_chunks: Option<u32>) -> Vec<Batch> {
    let cap = max_chunks.filter(|n| *n > 0);
    let mut out = Vec::new();
    let mut current: Option<Batch> = None;

    for &index in staged {
        current = match current {
            Some(mut b)
                if b.end.checked_add(1) == Some(index) && cap.is_none_or(|n| b.chunk_count() < n) =>
            {
                b.end = index;
                Some(b)
            }
            Some(b) => {
                out.push(b);
                Some(Batch::new(index, index))
            }
            None => Some(Batch::new(index, index)),
        };
    }
    out.extend(current);
    out
}

/// A batch whose archive is complete on disk and awaiting upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBatch {
    pub batch: Batch,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BatchBuilder {
    staging_dir: PathBuf,
    archive_dir: PathBuf,
    chunk_size: u64,
    compression: Compression,
    max_batch_chunks: Option<u32>,
}

impl BatchBuilder {
    pub fn new(
        staging_dir: PathBuf,
        archive_dir: PathBuf,
        chunk_size: u64,
        compression: Compression,
        max_batch_chunks: Option<u32>,
    ) -> Self {
        Self {
            staging_dir,
            archive_dir,
            chunk_size,
            compression,
            max_batch_chunks,
        }
    }

    pub fn build(&self, staged: &BTreeSet<u32>) -> Vec<Batch> {
        build_batches(staged, self.max_batch_chunks)
    }

    /// Packs the staged chunks of `batch` into one archive, then removes the staged files.
    ///
    /// On error no archive is left behind and every staged chunk stays where it was.
    pub fn seal(&self, batch: Batch) -> Result<SealedBatch> {
        let dest = archive_path(&self.archive_dir, batch);
        let mut writer = ArchiveWriter::create(
            &dest,
            batch.start,
            batch.end,
            self.chunk_size,
            self.compression,
        )?;
        for index in batch.indices() {
            let path = staged_chunk_path(&self.staging_dir, index);
            let bytes = std::fs::read(&path).map_err(|e| Error::Archive {
                message: format!("read staged chunk {index}: {e}"),
            })?;
            writer.push(index, &bytes)?;
        }
        let header = writer.finish()?;

        for index in batch.indices() {
            let path = staged_chunk_path(&self.staging_dir, index);
            if let Err(e) = std::fs::remove_file(&path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(
                    event = "batch.staged_cleanup_failed",
                    index,
                    path = %path.display(),
                    error = %e,
                    "failed to remove staged chunk"
                );
            }
        }

        tracing::debug!(
            event = "batch.sealed",
            start = batch.start,
            end = batch.end,
            entries = header.entries.len(),
            path = %dest.display(),
            "batch sealed"
        );
        Ok(SealedBatch { batch, path: dest })
    }
}
