use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::atomic_file::{WriteOptions, write_atomic_with_options};
use crate::engine::{ReadError, TransferEngine};

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("chunk {index} read timed out")]
    Timeout { index: u32 },

    #[error("chunk {index} is not available")]
    Unavailable { index: u32 },

    #[error("stage io error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn staged_chunk_path(staging_dir: &Path, index: u32) -> PathBuf {
    staging_dir.join(format!("chunk_{index:08}.dat"))
}

pub fn parse_staged_chunk_name(name: &str) -> Option<u32> {
    name.strip_prefix("chunk_")?
        .strip_suffix(".dat")?
        .parse()
        .ok()
}

/// Copies completed chunks out of the engine into the staging directory.
pub struct ChunkStager {
    engine: Arc<dyn TransferEngine>,
    staging_dir: PathBuf,
    read_timeout: Duration,
}

impl ChunkStager {
    pub fn new(engine: Arc<dyn TransferEngine>, staging_dir: PathBuf, read_timeout: Duration) -> Self {
        Self {
            engine,
            staging_dir,
            read_timeout,
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub async fn stage(&self, index: u32) -> Result<PathBuf, StageError> {
        let bytes = self
            .engine
            .read_chunk(index, self.read_timeout)
            .await
            .map_err(|e| match e {
                ReadError::Timeout { index } => StageError::Timeout { index },
                ReadError::Unavailable { index } => StageError::Unavailable { index },
                ReadError::Io(e) => StageError::Io(e),
            })?;

        let path = staged_chunk_path(&self.staging_dir, index);
        let dest = path.clone();
        // Staged chunks are re-derivable from the engine, so skip the directory fsync.
        let options = WriteOptions {
            fsync_file: true,
            fsync_dir: false,
        };
        tokio::task::spawn_blocking(move || write_atomic_with_options(&dest, &bytes, options))
            .await
            .map_err(std::io::Error::other)??;

        tracing::debug!(event = "stage.ok", index, path = %path.display(), "chunk staged");
        Ok(path)
    }
}
