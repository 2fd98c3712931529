//! Transfer engine seam.
//!
//! The engine is the component actually retrieving content from peers. The pipeline only needs
//! to know which chunks are complete, how to read one, and some live statistics for observers.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub type EngineFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFile {
    pub path: String,
    pub size: u64,
}

/// Layout of the content once metadata is known. Files are laid out back to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    pub name: String,
    pub total_bytes: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub files: Vec<ContentFile>,
}

impl ContentInfo {
    pub fn new(
        name: String,
        total_bytes: u64,
        chunk_size: u64,
        files: Vec<ContentFile>,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidConfig {
                message: "chunk_size must be > 0".to_string(),
            });
        }
        let total_chunks = u32::try_from(total_bytes.div_ceil(chunk_size)).map_err(|_| {
            Error::InvalidConfig {
                message: format!("too many chunks for total_bytes={total_bytes}"),
            }
        })?;
        Ok(Self {
            name,
            total_bytes,
            chunk_size,
            total_chunks,
            files,
        })
    }

    pub fn chunk_offset(&self, index: u32) -> u64 {
        u64::from(index) * self.chunk_size
    }

    /// Length of chunk `index`; only the last chunk may be shorter than `chunk_size`.
    pub fn chunk_len(&self, index: u32) -> u64 {
        let start = self.chunk_offset(index);
        self.total_bytes.saturating_sub(start).min(self.chunk_size)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileProgress {
    pub index: usize,
    pub path: String,
    pub size: u64,
    pub downloaded: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub peer_count: u32,
    /// Bytes per second.
    pub download_rate: u64,
    pub files: Vec<FileProgress>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("chunk {index} read timed out")]
    Timeout { index: u32 },

    #[error("chunk {index} is not available")]
    Unavailable { index: u32 },

    #[error("chunk read io error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait TransferEngine: Send + Sync {
    /// `None` while the engine is still fetching metadata.
    fn content_info(&self) -> Option<ContentInfo>;

    fn is_available(&self, index: u32) -> bool;

    /// Reads one complete chunk, giving up after `timeout`.
    fn read_chunk<'a>(
        &'a self,
        index: u32,
        timeout: Duration,
    ) -> EngineFuture<'a, std::result::Result<Vec<u8>, ReadError>>;

    fn overall_stats(&self) -> EngineStats;

    fn is_complete(&self) -> bool;

    /// Hint that these chunks are already offloaded and need not be fetched again.
    fn skip_chunks(&self, _indices: &[u32]) {}
}

/// Per-file progress for back-to-back files given the number of bytes present from the start.
fn file_progress(files: &[ContentFile], downloaded_prefix: u64) -> Vec<FileProgress> {
    let mut offset = 0u64;
    files
        .iter()
        .enumerate()
        .map(|(index, f)| {
            let downloaded = downloaded_prefix.saturating_sub(offset).min(f.size);
            offset = offset.saturating_add(f.size);
            FileProgress {
                index,
                path: f.path.clone(),
                size: f.size,
                downloaded,
            }
        })
        .collect()
}

/// Engine over a content file written sequentially by an external downloader.
///
/// Chunk `i` counts as available once the file holds its whole byte range. Metadata is known once
/// the file exists.
pub struct FileEngine {
    path: PathBuf,
    info: ContentInfo,
    rate: Mutex<RateSample>,
}

#[derive(Debug)]
struct RateSample {
    at: Instant,
    bytes: u64,
    rate: u64,
}

impl FileEngine {
    pub fn new(path: PathBuf, info: ContentInfo) -> Self {
        Self {
            path,
            info,
            rate: Mutex::new(RateSample {
                at: Instant::now(),
                bytes: 0,
                rate: 0,
            }),
        }
    }

    fn present_bytes(&self) -> u64 {
        std::fs::metadata(&self.path)
            .map(|m| m.len().min(self.info.total_bytes))
            .unwrap_or(0)
    }

    fn read_range(path: PathBuf, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
        let mut f = std::fs::File::open(path)?;
        f.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        f.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl TransferEngine for FileEngine {
    fn content_info(&self) -> Option<ContentInfo> {
        self.path.exists().then(|| self.info.clone())
    }

    fn is_available(&self, index: u32) -> bool {
        if index >= self.info.total_chunks {
            return false;
        }
        let end = self.info.chunk_offset(index) + self.info.chunk_len(index);
        self.present_bytes() >= end
    }

    fn read_chunk<'a>(
        &'a self,
        index: u32,
        timeout: Duration,
    ) -> EngineFuture<'a, std::result::Result<Vec<u8>, ReadError>> {
        Box::pin(async move {
            if !self.is_available(index) {
                return Err(ReadError::Unavailable { index });
            }
            let path = self.path.clone();
            let offset = self.info.chunk_offset(index);
            let len = self.info.chunk_len(index);
            let read = tokio::task::spawn_blocking(move || Self::read_range(path, offset, len));
            match tokio::time::timeout(timeout, read).await {
                Err(_) => Err(ReadError::Timeout { index }),
                Ok(Err(join)) => Err(ReadError::Io(std::io::Error::other(join))),
                Ok(Ok(res)) => Ok(res?),
            }
        })
    }

    fn overall_stats(&self) -> EngineStats {
        let present = self.present_bytes();
        let now = Instant::now();
        let rate = {
            let mut sample = self.rate.lock().unwrap_or_else(PoisonError::into_inner);
            let dt_ms = now.duration_since(sample.at).as_millis() as u64;
            // Avoid oscillating noise when polled too frequently.
            if dt_ms >= 250 {
                let db = present.saturating_sub(sample.bytes);
                sample.rate = db.saturating_mul(1000) / dt_ms;
                sample.at = now;
                sample.bytes = present;
            }
            sample.rate
        };
        EngineStats {
            downloaded_bytes: present,
            total_bytes: self.info.total_bytes,
            peer_count: 0,
            download_rate: rate,
            files: file_progress(&self.info.files, present),
        }
    }

    fn is_complete(&self) -> bool {
        self.present_bytes() >= self.info.total_bytes
    }
}

/// Scriptable in-memory engine for tests and dry runs.
pub struct ScriptedEngine {
    state: Mutex<ScriptedState>,
}

#[derive(Debug, Default)]
struct ScriptedState {
    info: Option<ContentInfo>,
    chunks: BTreeMap<u32, Vec<u8>>,
    stalled: BTreeSet<u32>,
    reads: Vec<u32>,
    skipped: BTreeSet<u32>,
    peers: u32,
    rate: u64,
    complete: bool,
}

impl ScriptedEngine {
    /// Engine that already knows its metadata.
    pub fn new(info: ContentInfo) -> Self {
        let engine = Self::awaiting_metadata();
        engine.lock().info = Some(info);
        engine
    }

    pub fn awaiting_metadata() -> Self {
        Self {
            state: Mutex::new(ScriptedState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deterministic chunk contents used by [`ScriptedEngine::make_available`].
    pub fn pattern(index: u32, len: u64) -> Vec<u8> {
        (0..len)
            .map(|i| (u64::from(index).wrapping_mul(31).wrapping_add(i) % 251) as u8)
            .collect()
    }

    pub fn set_metadata(&self, info: ContentInfo) {
        self.lock().info = Some(info);
    }

    /// Marks the given indices as downloaded with [`ScriptedEngine::pattern`] contents.
    pub fn make_available(&self, indices: impl IntoIterator<Item = u32>) {
        let mut st = self.lock();
        let Some(info) = st.info.clone() else {
            return;
        };
        for index in indices {
            if index < info.total_chunks {
                let bytes = Self::pattern(index, info.chunk_len(index));
                st.chunks.insert(index, bytes);
            }
        }
    }

    /// Reads of these indices never complete and hit the caller's timeout.
    pub fn stall(&self, index: u32) {
        self.lock().stalled.insert(index);
    }

    pub fn unstall(&self, index: u32) {
        self.lock().stalled.remove(&index);
    }

    pub fn set_peers(&self, peers: u32, rate: u64) {
        let mut st = self.lock();
        st.peers = peers;
        st.rate = rate;
    }

    pub fn set_complete(&self, complete: bool) {
        self.lock().complete = complete;
    }

    /// Indices passed to `read_chunk`, in call order.
    pub fn reads(&self) -> Vec<u32> {
        self.lock().reads.clone()
    }

    pub fn skipped(&self) -> BTreeSet<u32> {
        self.lock().skipped.clone()
    }
}

impl TransferEngine for ScriptedEngine {
    fn content_info(&self) -> Option<ContentInfo> {
        self.lock().info.clone()
    }

    fn is_available(&self, index: u32) -> bool {
        self.lock().chunks.contains_key(&index)
    }

    fn read_chunk<'a>(
        &'a self,
        index: u32,
        timeout: Duration,
    ) -> EngineFuture<'a, std::result::Result<Vec<u8>, ReadError>> {
        Box::pin(async move {
            let (stalled, bytes) = {
                let mut st = self.lock();
                st.reads.push(index);
                (st.stalled.contains(&index), st.chunks.get(&index).cloned())
            };
            if stalled {
                tokio::time::sleep(timeout).await;
                return Err(ReadError::Timeout { index });
            }
            bytes.ok_or(ReadError::Unavailable { index })
        })
    }

    fn overall_stats(&self) -> EngineStats {
        let st = self.lock();
        let Some(info) = st.info.as_ref() else {
            return EngineStats {
                peer_count: st.peers,
                download_rate: st.rate,
                ..EngineStats::default()
            };
        };
        let downloaded: u64 = st.chunks.values().map(|c| c.len() as u64).sum();
        // Files are attributed the contiguous prefix so per-file numbers stay consistent.
        let mut prefix = 0u64;
        for index in 0..info.total_chunks {
            if !st.chunks.contains_key(&index) {
                break;
            }
            prefix += info.chunk_len(index);
        }
        EngineStats {
            downloaded_bytes: downloaded,
            total_bytes: info.total_bytes,
            peer_count: st.peers,
            download_rate: st.rate,
            files: file_progress(&info.files, prefix),
        }
    }

    fn is_complete(&self) -> bool {
        let st = self.lock();
        st.complete
            || st
                .info
                .as_ref()
                .is_some_and(|i| st.chunks.len() as u64 == u64::from(i.total_chunks))
    }

    fn skip_chunks(&self, indices: &[u32]) {
        self.lock().skipped.extend(indices.iter().copied());
    }
}
