use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chunkferry_core::config::{self as settings_config, Settings};
use chunkferry_core::run_log::{self, RunKind};
use chunkferry_core::{
    APP_NAME, Checkpoint, CheckpointStore, ProgressSnapshot, RestoreOptions, StoreError,
    open_store, read_checkpoint, restore_content,
};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use serde::Serialize;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "chunkferry")]
#[command(about = "Inspect and restore offloaded chunk content", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Checkpoint {
        #[command(subcommand)]
        cmd: CheckpointCmd,
    },
    /// Reassemble the content from the uploaded archives.
    Restore {
        #[arg(long)]
        output: PathBuf,
    },
    /// Connect as an observer and print the first progress snapshot.
    Status {
        #[arg(long)]
        url: Option<String>,

        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[derive(Subcommand)]
enum CheckpointCmd {
    Show {
        /// Reconcile with the remote copy instead of reading only the local file.
        #[arg(long)]
        remote: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCmd {
    Validate,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| {
            std::env::var("CHUNKFERRY_CONFIG_DIR")
                .ok()
                .map(PathBuf::from)
        })
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("CHUNKFERRY_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_data_dir);

    match cli.cmd {
        Command::Checkpoint { cmd } => match cmd {
            CheckpointCmd::Show { remote } => {
                checkpoint_show(&config_dir, &data_dir, remote, cli.json).await
            }
        },
        Command::Restore { output } => {
            restore_run(&config_dir, &data_dir, &output, cli.json).await
        }
        Command::Status { url, timeout_secs } => {
            status_get(&config_dir, url, Duration::from_secs(timeout_secs), cli.json).await
        }
        Command::Config { cmd } => match cmd {
            ConfigCmd::Validate => config_validate(&config_dir, cli.json),
        },
    }
}

fn load_settings(config_dir: &Path) -> Result<Settings, CliError> {
    let settings = settings_config::load_settings(config_dir).map_err(map_core_err)?;
    settings_config::validate_settings(&settings).map_err(map_core_err)?;
    Ok(settings)
}

fn config_validate(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = load_settings(config_dir)?;
    let info = settings.content_info().map_err(map_core_err)?;
    if json {
        println!(
            "{}",
            serde_json::json!({
                "ok": true,
                "configPath": settings_config::config_path(config_dir).display().to_string(),
                "totalChunks": info.total_chunks,
                "store": settings.store.kind,
            })
        );
    } else {
        println!(
            "{APP_NAME}: config ok ({} chunks of {} bytes, store {:?})",
            info.total_chunks, info.chunk_size, settings.store.kind
        );
    }
    Ok(())
}

async fn load_checkpoint(
    settings: &Settings,
    data_dir: &Path,
    remote: bool,
) -> Result<Option<Checkpoint>, CliError> {
    let local_path = data_dir.join(&settings.store.checkpoint_name);
    if !remote {
        return read_checkpoint(&local_path).map_err(map_core_err);
    }
    let store = open_store(&settings.store).map_err(map_core_err)?;
    let repo = store
        .ensure_repository(&settings.store.repository)
        .await
        .map_err(map_store_err)?;
    let mut checkpoints = CheckpointStore::with_remote(
        local_path,
        store,
        repo,
        settings.store.checkpoint_name.clone(),
    );
    let expected_total = settings.content_info().ok().map(|info| info.total_chunks);
    checkpoints.load(expected_total).await.map_err(map_core_err)
}

async fn checkpoint_show(
    config_dir: &Path,
    data_dir: &Path,
    remote: bool,
    json: bool,
) -> Result<(), CliError> {
    let settings = load_settings(config_dir)?;
    let checkpoint = load_checkpoint(&settings, data_dir, remote)
        .await?
        .ok_or_else(|| CliError::new("checkpoint.missing", "no checkpoint found"))?;

    if json {
        let text = serde_json::to_string(&checkpoint)
            .map_err(|e| CliError::new("unknown", e.to_string()))?;
        println!("{text}");
    } else {
        let frontier = checkpoint
            .frontier
            .map(|f| f.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "frontier={frontier} uploaded={}/{} archives={} updated={}",
            checkpoint.uploaded.len(),
            checkpoint.total_chunks,
            checkpoint.archives.len(),
            checkpoint.timestamp
        );
    }
    Ok(())
}

async fn restore_run(
    config_dir: &Path,
    data_dir: &Path,
    output: &Path,
    json: bool,
) -> Result<(), CliError> {
    let settings = load_settings(config_dir)?;
    let run_id = format!("restore_{}", std::process::id());
    let _run_log = run_log::start_run_log(RunKind::Restore, &run_id, data_dir)
        .map_err(|e| CliError::new("log.unavailable", e.to_string()))?;
    let checkpoint = load_checkpoint(&settings, data_dir, true)
        .await?
        .ok_or_else(|| CliError::new("checkpoint.missing", "no checkpoint found"))?;

    let store = open_store(&settings.store).map_err(map_core_err)?;
    let repo = store
        .ensure_repository(&settings.store.repository)
        .await
        .map_err(map_store_err)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let result = restore_content(
        store.as_ref(),
        &repo,
        &checkpoint,
        output,
        RestoreOptions {
            cancel: Some(&cancel),
        },
    )
    .await
    .map_err(map_core_err)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "output": output.display().to_string(),
                "archivesDownloaded": result.archives_downloaded,
                "chunksWritten": result.chunks_written,
                "bytesWritten": result.bytes_written,
                "missing": result.missing,
            })
        );
    } else {
        println!(
            "restored {} chunks ({} bytes) from {} archives into {}",
            result.chunks_written,
            result.bytes_written,
            result.archives_downloaded,
            output.display()
        );
        if !result.missing.is_empty() {
            println!("missing {} chunks", result.missing.len());
        }
    }

    if !result.missing.is_empty() {
        return Err(CliError::new(
            "restore.incomplete",
            format!("{} chunks are not uploaded yet", result.missing.len()),
        )
        .with_details(serde_json::json!({ "missing": result.missing })));
    }
    Ok(())
}

async fn status_get(
    config_dir: &Path,
    url: Option<String>,
    timeout: Duration,
    json: bool,
) -> Result<(), CliError> {
    let url = match url {
        Some(url) => url,
        None => format!("ws://{}", load_settings(config_dir)?.observers.listen),
    };

    let (mut ws, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(&url))
        .await
        .map_err(|_| CliError::retryable("status.timeout", format!("connect {url} timed out")))?
        .map_err(|e| CliError::retryable("status.unavailable", format!("connect {url}: {e}")))?;

    let text = loop {
        let next = tokio::time::timeout(timeout, ws.next())
            .await
            .map_err(|_| CliError::retryable("status.timeout", "no snapshot received"))?;
        match next {
            Some(Ok(Message::Text(text))) => break text.as_str().to_string(),
            Some(Ok(Message::Close(_))) | None => {
                return Err(CliError::retryable("status.closed", "observer stream closed"));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(CliError::retryable("status.unavailable", e.to_string())),
        }
    };
    let _ = ws.close(None).await;

    if json {
        println!("{text}");
        return Ok(());
    }
    let snapshot: ProgressSnapshot = serde_json::from_str(&text)
        .map_err(|e| CliError::new("status.invalid", e.to_string()))?;
    println!(
        "{:.2}% peers={} at {}",
        snapshot.total_progress, snapshot.peers, snapshot.timestamp
    );
    for f in &snapshot.files {
        println!(
            "  [{}] {} {}/{} ({:.2}%, {:.0} B/s)",
            f.index, f.path, f.downloaded, f.size, f.progress, f.speed
        );
    }
    Ok(())
}

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join("chunkferry")
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".local")
        .join("share")
        .join("chunkferry")
}

fn map_store_err(e: StoreError) -> CliError {
    match e {
        StoreError::Unreachable { message } => CliError::retryable("store.unavailable", message),
        StoreError::Timeout => CliError::retryable("store.timeout", "store request timed out"),
        StoreError::Rejected { message } => CliError::new("store.rejected", message),
        StoreError::NotFound { path } => {
            CliError::new("store.not_found", format!("artifact not found: {path}"))
        }
    }
}

fn map_core_err(e: chunkferry_core::Error) -> CliError {
    match e {
        chunkferry_core::Error::InvalidConfig { message } => {
            CliError::new("config.invalid", message)
        }
        chunkferry_core::Error::Store(e) => map_store_err(e),
        chunkferry_core::Error::Setup { message } => CliError::new("setup.failed", message),
        chunkferry_core::Error::Integrity { message } => CliError::new("integrity", message),
        chunkferry_core::Error::Archive { message } => CliError::new("archive.invalid", message),
        chunkferry_core::Error::Cancelled => CliError::new("task.cancelled", "cancelled"),
        other => CliError::new("unknown", other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| {
        "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}"
            .to_string()
    });
    let _ = writeln!(std::io::stderr(), "{json}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_retryable_codes() {
        let e = map_core_err(chunkferry_core::Error::Store(StoreError::Timeout));
        assert_eq!(e.code, "store.timeout");
        assert!(e.retryable);

        let e = map_core_err(chunkferry_core::Error::Store(StoreError::Rejected {
            message: "no".to_string(),
        }));
        assert!(!e.retryable);
    }

    #[test]
    fn cli_error_serializes_with_stable_fields() {
        let e = CliError::new("checkpoint.missing", "no checkpoint found");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["code"], "checkpoint.missing");
        assert_eq!(v["retryable"], false);
        assert!(v.get("details").is_some());
    }

    #[test]
    fn args_parse() {
        let cli = Cli::try_parse_from(["chunkferry", "--json", "restore", "--output", "/tmp/x"])
            .unwrap();
        assert!(cli.json);
        assert!(matches!(cli.cmd, Command::Restore { .. }));
    }
}
