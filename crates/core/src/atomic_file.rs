use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    pub fsync_file: bool,
    pub fsync_dir: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            fsync_file: true,
            fsync_dir: true,
        }
    }
}

/// Temp files carry `.tmp.<pid>` after the final extension; anything matching is a leftover of an
/// interrupted write.
pub fn is_temp_file_name(name: &str) -> bool {
    name.contains(".tmp.") || name.ends_with(".tmp")
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    write_atomic_with_options(path, bytes, WriteOptions::default())
}

pub fn write_atomic_with_options(
    path: &Path,
    bytes: &[u8],
    options: WriteOptions,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin")
        .to_string();
    let tmp = path.with_extension(format!("{ext}.tmp.{}", std::process::id()));

    let written = (|| {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        if options.fsync_file {
            f.sync_all()?;
        }
        drop(f);
        std::fs::rename(&tmp, path)
    })();

    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }

    // Best-effort directory sync (ignored on platforms where it isn't supported).
    if options.fsync_dir
        && let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }

    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let data = serde_json::to_vec(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    write_atomic(path, &data)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> std::io::Result<T> {
    let mut f = File::open(path)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;
    serde_json::from_slice(&buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_json_atomic(&path, &serde_json::json!({ "n": 1 })).unwrap();
        write_json_atomic(&path, &serde_json::json!({ "n": 2 })).unwrap();

        let v: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(v["n"], 2);

        let names: Vec<String> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["state.json".to_string()]);
    }

    #[test]
    fn temp_names_are_recognized() {
        assert!(is_temp_file_name("chunk_00000003.dat.tmp.4242"));
        assert!(is_temp_file_name("config.tmp"));
        assert!(!is_temp_file_name("chunk_00000003.dat"));
    }
}
