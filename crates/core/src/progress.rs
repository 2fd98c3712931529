use serde::{Deserialize, Serialize};

use crate::checkpoint::utc_timestamp;
use crate::engine::EngineStats;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStatus {
    pub index: usize,
    pub path: String,
    pub size: u64,
    pub downloaded: u64,
    /// Bytes per second, the overall rate apportioned by file size.
    pub speed: f64,
    /// Percent, 0-100.
    pub progress: f64,
}

/// What observers receive. Superseded by the next snapshot, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub files: Vec<FileStatus>,
    pub peers: u32,
    pub total_progress: f64,
    pub timestamp: String,
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

impl ProgressSnapshot {
    pub fn empty() -> Self {
        Self {
            files: Vec::new(),
            peers: 0,
            total_progress: 0.0,
            timestamp: utc_timestamp(),
        }
    }

    pub fn from_stats(stats: &EngineStats) -> Self {
        let files = stats
            .files
            .iter()
            .map(|f| FileStatus {
                index: f.index,
                path: f.path.clone(),
                size: f.size,
                downloaded: f.downloaded,
                speed: if stats.total_bytes > 0 {
                    stats.download_rate as f64 * f.size as f64 / stats.total_bytes as f64
                } else {
                    0.0
                },
                progress: percent(f.downloaded, f.size),
            })
            .collect();
        Self {
            files,
            peers: stats.peer_count,
            total_progress: percent(stats.downloaded_bytes, stats.total_bytes),
            timestamp: utc_timestamp(),
        }
    }
}
