use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::archive::{ArchiveHeader, extract_chunk, read_archive_header};
use crate::checkpoint::{ArchiveRecord, Checkpoint};
use crate::store::{RemoteStore, RepoHandle};
use crate::{Error, Result};

#[derive(Default)]
pub struct RestoreOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreResult {
    pub archives_downloaded: usize,
    pub chunks_written: u64,
    pub bytes_written: u64,
    /// Chunks no uploaded archive covers.
    pub missing: Vec<u32>,
}

/// Reassembles the content from every archive listed in `checkpoint` into `output`.
///
/// Each chunk is written at `index * chunk_size`; entry hashes are verified before writing.
pub async fn restore_content(
    store: &dyn RemoteStore,
    repo: &RepoHandle,
    checkpoint: &Checkpoint,
    output: &Path,
    options: RestoreOptions<'_>,
) -> Result<RestoreResult> {
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let out = File::create(output)?;

    let mut result = RestoreResult::default();
    let mut covered = BTreeSet::new();

    for record in &checkpoint.archives {
        if let Some(cancel) = options.cancel
            && cancel.is_cancelled()
        {
            return Err(Error::Cancelled);
        }

        let bytes = store.download_artifact(repo, &record.path).await?;
        result.archives_downloaded += 1;
        let header = read_archive_header(&bytes)?;
        if (header.start, header.end) != (record.start, record.end) {
            return Err(Error::Integrity {
                message: format!(
                    "archive {} covers {}..={}, expected {}..={}",
                    record.path, header.start, header.end, record.start, record.end
                ),
            });
        }

        check_entries(record, &header, checkpoint.total_chunks)?;

        let mut chunks = Vec::with_capacity(header.entries.len());
        for entry in &header.entries {
            chunks.push((entry.index, extract_chunk(&bytes, &header, entry)?));
        }
        let chunk_size = header.chunk_size;
        let out = out.try_clone()?;
        let written = tokio::task::spawn_blocking(move || write_chunks(out, chunk_size, &chunks))
            .await
            .map_err(std::io::Error::other)??;

        result.chunks_written += written.0;
        result.bytes_written += written.1;
        covered.extend(record.start..=record.end);
        tracing::debug!(
            event = "restore.archive",
            path = %record.path,
            start = record.start,
            end = record.end,
            "archive restored"
        );
    }
    out.sync_all()?;

    result.missing = (0..checkpoint.total_chunks)
        .filter(|i| !covered.contains(i))
        .collect();
    tracing::info!(
        event = "restore.done",
        archives = result.archives_downloaded,
        chunks = result.chunks_written,
        bytes = result.bytes_written,
        missing = result.missing.len(),
        output = %output.display(),
        "restore finished"
    );
    Ok(result)
}

/// Entries must be exactly `record.start..=record.end`, in order, inside the content.
fn check_entries(record: &ArchiveRecord, header: &ArchiveHeader, total_chunks: u32) -> Result<()> {
    let bad = |message: String| Error::Integrity {
        message: format!("archive {}: {message}", record.path),
    };
    if record.start > record.end || record.end >= total_chunks {
        return Err(bad(format!(
            "range {}..={} outside {total_chunks} chunks",
            record.start, record.end
        )));
    }
    let wanted = u64::from(record.end - record.start) + 1;
    if header.entries.len() as u64 != wanted {
        return Err(bad(format!(
            "{} entries for {wanted} chunks",
            header.entries.len()
        )));
    }
    for (entry, index) in header.entries.iter().zip(record.start..=record.end) {
        if entry.index != index {
            return Err(bad(format!("entry {} where {index} was expected", entry.index)));
        }
    }
    Ok(())
}

fn write_chunks(
    mut out: File,
    chunk_size: u64,
    chunks: &[(u32, Vec<u8>)],
) -> std::io::Result<(u64, u64)> {
    let mut bytes = 0u64;
    for (index, data) in chunks {
        out.seek(SeekFrom::Start(u64::from(*index) * chunk_size))?;
        out.write_all(data)?;
        bytes += data.len() as u64;
    }
    Ok((chunks.len() as u64, bytes))
}

