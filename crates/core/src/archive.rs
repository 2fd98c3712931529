//! Batch archive format.
//!
//! Layout: `[entry bodies][header json][u32 LE header length]`. Each entry body is the chunk's
//! bytes, optionally zstd-compressed on its own so a single chunk can be extracted without
//! touching the others. The header records the blake3 hash of the raw bytes of every entry.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const ARCHIVE_VERSION: u32 = 1;
const HASH_ALG: &str = "blake3";
const HEADER_TRAILER_BYTES: usize = 4;
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zstd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveHeader {
    pub version: u32,
    pub hash_alg: String,
    pub compression: Compression,
    pub start: u32,
    pub end: u32,
    pub chunk_size: u64,
    pub entries: Vec<ArchiveEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub index: u32,
    pub offset: u64,
    /// Stored length (after compression).
    pub len: u64,
    pub raw_len: u64,
    pub hash: String,
}

/// Streams entries into a temp file next to `dest`; `finish` appends the header and renames.
/// Dropping an unfinished writer removes the temp file.
pub struct ArchiveWriter {
    file: Option<File>,
    tmp: PathBuf,
    dest: PathBuf,
    offset: u64,
    header: ArchiveHeader,
}

impl ArchiveWriter {
    pub fn create(
        dest: &Path,
        start: u32,
        end: u32,
        chunk_size: u64,
        compression: Compression,
    ) -> Result<Self> {
        if end < start {
            return Err(Error::Archive {
                message: format!("invalid archive range {start}..={end}"),
            });
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let ext = dest
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("pack")
            .to_string();
        let tmp = dest.with_extension(format!("{ext}.tmp.{}", std::process::id()));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        Ok(Self {
            file: Some(file),
            tmp,
            dest: dest.to_path_buf(),
            offset: 0,
            header: ArchiveHeader {
                version: ARCHIVE_VERSION,
                hash_alg: HASH_ALG.to_string(),
                compression,
                start,
                end,
                chunk_size,
                entries: Vec::new(),
            },
        })
    }

    /// Entries must be pushed in ascending index order, each index of the range exactly once.
    pub fn push(&mut self, index: u32, raw: &[u8]) -> Result<()> {
        let expected = match self.header.entries.last() {
            Some(last) => last.index.checked_add(1),
            None => Some(self.header.start),
        };
        if expected != Some(index) || index > self.header.end {
            return Err(Error::Archive {
                message: format!("unexpected entry {index} (expected {expected:?})"),
            });
        }
        let Some(file) = self.file.as_mut() else {
            return Err(Error::Archive {
                message: "archive writer already finished".to_string(),
            });
        };

        let hash = blake3::hash(raw).to_hex().to_string();
        let stored = match self.header.compression {
            Compression::None => None,
            Compression::Zstd => Some(zstd::stream::encode_all(raw, ZSTD_LEVEL)?),
        };
        let body = stored.as_deref().unwrap_or(raw);
        file.write_all(body)?;

        self.header.entries.push(ArchiveEntry {
            index,
            offset: self.offset,
            len: body.len() as u64,
            raw_len: raw.len() as u64,
            hash,
        });
        self.offset += body.len() as u64;
        Ok(())
    }

    pub fn finish(mut self) -> Result<ArchiveHeader> {
        let covered = self.header.entries.len() as u64;
        let wanted = u64::from(self.header.end - self.header.start) + 1;
        if covered != wanted {
            return Err(Error::Archive {
                message: format!("archive holds {covered} of {wanted} entries"),
            });
        }
        let Some(mut file) = self.file.take() else {
            return Err(Error::Archive {
                message: "archive writer already finished".to_string(),
            });
        };

        let header_json = serde_json::to_vec(&self.header)?;
        let header_len = u32::try_from(header_json.len()).map_err(|_| Error::Archive {
            message: "archive header too large".to_string(),
        })?;
        file.write_all(&header_json)?;
        file.write_all(&header_len.to_le_bytes())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&self.tmp, &self.dest)?;
        if let Some(parent) = self.dest.parent()
            && let Ok(dir) = File::open(parent)
        {
            let _ = dir.sync_all();
        }
        Ok(self.header.clone())
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.tmp);
        }
    }
}

fn payload_end(bytes: &[u8]) -> Result<usize> {
    if bytes.len() < HEADER_TRAILER_BYTES {
        return Err(Error::Integrity {
            message: "archive too small".to_string(),
        });
    }
    let mut trailer = [0u8; HEADER_TRAILER_BYTES];
    trailer.copy_from_slice(&bytes[bytes.len() - HEADER_TRAILER_BYTES..]);
    let header_len = u32::from_le_bytes(trailer) as usize;
    if header_len > bytes.len() - HEADER_TRAILER_BYTES {
        return Err(Error::Integrity {
            message: "archive header length out of bounds".to_string(),
        });
    }
    Ok(bytes.len() - HEADER_TRAILER_BYTES - header_len)
}

pub fn read_archive_header(bytes: &[u8]) -> Result<ArchiveHeader> {
    let end = payload_end(bytes)?;
    let header: ArchiveHeader = serde_json::from_slice(&bytes[end..bytes.len() - HEADER_TRAILER_BYTES])
        .map_err(|e| Error::Integrity {
            message: format!("invalid archive header json: {e}"),
        })?;

    if header.version != ARCHIVE_VERSION {
        return Err(Error::Archive {
            message: format!("unsupported archive version: {}", header.version),
        });
    }
    if header.hash_alg != HASH_ALG {
        return Err(Error::Archive {
            message: format!("unsupported archive hash_alg: {}", header.hash_alg),
        });
    }
    for e in &header.entries {
        let Some(stop) = e.offset.checked_add(e.len) else {
            return Err(Error::Integrity {
                message: format!("archive entry {} overflows", e.index),
            });
        };
        if stop > end as u64 {
            return Err(Error::Integrity {
                message: format!("archive entry {} out of bounds", e.index),
            });
        }
    }
    Ok(header)
}

/// Returns the raw chunk bytes of `entry`, verifying length and hash.
pub fn extract_chunk(bytes: &[u8], header: &ArchiveHeader, entry: &ArchiveEntry) -> Result<Vec<u8>> {
    let start = entry.offset as usize;
    let stored = &bytes[start..start + entry.len as usize];
    let raw = match header.compression {
        Compression::None => stored.to_vec(),
        Compression::Zstd => zstd::stream::decode_all(stored).map_err(|e| Error::Integrity {
            message: format!("chunk {} decompress failed: {e}", entry.index),
        })?,
    };
    if raw.len() as u64 != entry.raw_len {
        return Err(Error::Integrity {
            message: format!(
                "chunk {} length mismatch: {} != {}",
                entry.index,
                raw.len(),
                entry.raw_len
            ),
        });
    }
    let hash = blake3::hash(&raw).to_hex().to_string();
    if hash != entry.hash {
        return Err(Error::Integrity {
            message: format!("chunk {} hash mismatch", entry.index),
        });
    }
    Ok(raw)
}
