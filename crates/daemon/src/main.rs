use std::path::{Path, PathBuf};
use std::sync::Arc;

use chunkferry_core::config as settings_config;
use chunkferry_core::run_log::{self, RunKind};
use chunkferry_core::{
    FileEngine, OffloadController, ProgressBroadcaster, TransferEngine, open_store,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

mod observer_ws;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_root = std::env::var("CHUNKFERRY_CONFIG_DIR")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(default_config_dir);
    let data_root = std::env::var("CHUNKFERRY_DATA_DIR")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(default_data_dir);

    run_log::init_logging(true);

    let settings = settings_config::load_settings(&config_root)?;
    settings_config::validate_settings(&settings)?;

    let run_id = format!("run_{}", Uuid::new_v4().simple());
    let run_log = run_log::start_run_log(RunKind::Offload, &run_id, &data_root)?;

    let info = settings.content_info()?;
    let content_path = resolve_content_path(&data_root, &settings.content.path);
    tracing::info!(
        event = "run.start",
        kind = "offload",
        run_id = %run_id,
        content = %info.name,
        content_path = %content_path.display(),
        total_chunks = info.total_chunks,
        store = ?settings.store.kind,
        repository = %settings.store.repository,
        log_path = %run_log.path().display(),
        "run.start"
    );

    let engine: Arc<dyn TransferEngine> = Arc::new(FileEngine::new(content_path, info));
    let store = open_store(&settings.store)?;
    let broadcaster = ProgressBroadcaster::new();

    let observers = observer_ws::spawn_observer_server(
        &settings.observers.listen,
        broadcaster.clone(),
        settings.observers.channel_capacity,
    )
    .await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(event = "run.interrupt", "interrupt received; stopping");
                cancel.cancel();
            }
        });
    }

    let result = OffloadController::new(
        engine,
        store,
        broadcaster,
        settings.offload_settings(),
        data_root.clone(),
        cancel,
    )
    .run()
    .await;

    observers.shutdown().await;

    match result {
        Ok(summary) => {
            tracing::info!(
                event = "run.finish",
                run_id = %run_id,
                status = if summary.cancelled { "cancelled" } else { "succeeded" },
                state = summary.state.as_str(),
                cycles = summary.cycles,
                uploaded_batches = summary.uploaded_batches,
                frontier = ?summary.frontier,
                teardown = ?summary.teardown,
                "run.finish"
            );
            drop(run_log);
            Ok(())
        }
        Err(e) => {
            tracing::error!(
                event = "run.finish",
                run_id = %run_id,
                status = "failed",
                error = %e,
                "run.finish"
            );
            drop(run_log);
            Err(e.into())
        }
    }
}

fn resolve_content_path(data_root: &Path, path: &str) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() { p } else { data_root.join(p) }
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
