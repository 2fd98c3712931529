use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::Utc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "CHUNKFERRY_LOG";
pub const LOG_DIR_ENV: &str = "CHUNKFERRY_LOG_DIR";
const DEFAULT_FILTER: &str = "info";

static SINK: OnceLock<RunSink> = OnceLock::new();
static SUBSCRIBER: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Offload,
    Restore,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offload => "offload",
            Self::Restore => "restore",
        }
    }
}

/// One NDJSON file per run; lines emitted outside a run are dropped.
#[derive(Debug, Default)]
struct RunSink {
    file: Mutex<Option<BufWriter<File>>>,
}

impl RunSink {
    fn slot(&self) -> MutexGuard<'_, Option<BufWriter<File>>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, path: &Path) -> std::io::Result<()> {
        let mut slot = self.slot();
        if slot.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "a run log is already open",
            ));
        }
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        *slot = Some(BufWriter::new(file));
        Ok(())
    }

    fn close(&self) -> std::io::Result<()> {
        if let Some(mut w) = self.slot().take() {
            w.flush()?;
            w.get_ref().sync_all()?;
        }
        Ok(())
    }
}

pub struct SinkWriter<'a>(MutexGuard<'a, Option<BufWriter<File>>>);

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.as_mut() {
            Some(w) => w.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.as_mut().map_or(Ok(()), |w| w.flush())
    }
}

fn sink() -> &'static RunSink {
    SINK.get_or_init(RunSink::default)
}

fn sink_writer() -> SinkWriter<'static> {
    SinkWriter(sink().slot())
}

fn env_filter(ours: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    ours.or(rust_log)
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber: JSON lines into the run sink, plus human-readable stderr
/// output when `stderr` is set. Only the first call has an effect.
pub fn init_logging(stderr: bool) {
    SUBSCRIBER.get_or_init(|| {
        let filter = env_filter(
            std::env::var(LOG_ENV).ok().as_deref(),
            std::env::var("RUST_LOG").ok().as_deref(),
        );
        let ndjson = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(sink_writer);
        let human = stderr.then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
        });
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(ndjson)
            .with(human)
            .try_init();
    });
}

/// Closes the run log (flush + fsync) on drop.
pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if let Err(e) = sink().close() {
            eprintln!("run log close failed: {e}");
        }
    }
}

/// Opens `<log dir>/<kind>-<utc>-<run_id>.ndjson`. The log dir is `$CHUNKFERRY_LOG_DIR` when set,
/// else `<data_dir>/logs`.
pub fn start_run_log(kind: RunKind, run_id: &str, data_dir: &Path) -> std::io::Result<RunLogGuard> {
    init_logging(false);

    let dir = std::env::var_os(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("logs"));
    std::fs::create_dir_all(&dir)?;

    let path = dir.join(format!(
        "{}-{}-{}.ndjson",
        kind.as_str(),
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        file_safe(run_id)
    ));
    sink().open(&path)?;
    Ok(RunLogGuard { path })
}

fn file_safe(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_prefers_own_env_then_rust_log() {
        assert_eq!(env_filter(Some("debug"), Some("warn")).to_string(), "debug");
        assert_eq!(env_filter(None, Some("warn")).to_string(), "warn");
        assert_eq!(env_filter(None, None).to_string(), "info");
    }

    #[test]
    fn run_ids_are_made_file_safe() {
        assert_eq!(file_safe("run a/b"), "run_a_b");
        assert_eq!(RunKind::Restore.as_str(), "restore");
    }

    #[test]
    fn run_log_holds_one_json_object_per_line() {
        let temp = tempfile::tempdir().unwrap();
        let guard = start_run_log(RunKind::Offload, "run_test", temp.path()).unwrap();
        assert_eq!(guard.path().parent(), Some(temp.path().join("logs").as_path()));
        let name = guard.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("offload-") && name.ends_with("-run_test.ndjson"));

        tracing::info!(event = "run.start", run_id = "run_test", "run.start");
        tracing::warn!(event = "upload.retry", attempt = 1, "upload.retry");

        let path = guard.path().to_path_buf();
        drop(guard);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.trim().is_empty());
        for line in text.lines() {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(v.get("timestamp").is_some());
            assert!(v.get("level").is_some());
            assert!(v["fields"].get("event").is_some() || v["fields"].get("message").is_some());
        }
    }
}
