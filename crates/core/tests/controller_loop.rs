use std::sync::Arc;
use std::time::Duration;

use chunkferry_core::{
    ContentFile, ContentInfo, ControllerState, Error, InMemoryStore, OffloadController,
    OffloadSettings, ProgressBroadcaster, RetryPolicy, ScriptedEngine, Teardown, read_checkpoint,
};
use tokio_util::sync::CancellationToken;

fn content(total_chunks: u32) -> ContentInfo {
    let total = u64::from(total_chunks) * 4;
    ContentInfo::new(
        "content".to_string(),
        total,
        4,
        vec![
            ContentFile {
                path: "a.bin".to_string(),
                size: total / 2,
            },
            ContentFile {
                path: "b.bin".to_string(),
                size: total - total / 2,
            },
        ],
    )
    .unwrap()
}

fn settings(upload_interval: Duration) -> OffloadSettings {
    OffloadSettings {
        upload_interval,
        status_interval: Duration::from_millis(5),
        retry: RetryPolicy {
            max_retries: 2,
            delay: Duration::from_millis(1),
        },
        chunk_read_timeout: Duration::from_millis(50),
        ..OffloadSettings::default()
    }
}

#[tokio::test]
async fn completion_flushes_everything_and_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let engine = Arc::new(ScriptedEngine::new(content(6)));
    engine.set_peers(3, 1000);
    engine.make_available(0..6);
    let broadcaster = ProgressBroadcaster::new();
    let mut sub = broadcaster.subscribe(64);

    let summary = OffloadController::new(
        engine.clone(),
        store.clone(),
        broadcaster.clone(),
        settings(Duration::from_secs(3600)),
        dir.path().to_path_buf(),
        CancellationToken::new(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(summary.state, ControllerState::Complete);
    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.uploaded_batches, 1);
    assert_eq!(summary.frontier, Some(5));
    assert_eq!(summary.teardown, Some(Teardown::Removed));
    assert!(!dir.path().join("staging").exists());

    let cp = read_checkpoint(&dir.path().join("download_progress.json"))
        .unwrap()
        .unwrap();
    assert!(cp.is_fully_uploaded());

    let mut snapshots = Vec::new();
    while let Ok(s) = sub.receiver.try_recv() {
        snapshots.push(s);
    }
    assert!(snapshots.len() >= 2);
    let last = snapshots.last().unwrap();
    assert_eq!(last.peers, 3);
    assert_eq!(last.total_progress, 100.0);
    assert_eq!(last.files.len(), 2);
    assert_eq!(last.files[0].speed, 500.0);
}

#[tokio::test]
async fn waits_for_metadata_before_touching_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let engine = Arc::new(ScriptedEngine::awaiting_metadata());
    let broadcaster = ProgressBroadcaster::new();

    let handle = tokio::spawn(
        OffloadController::new(
            engine.clone(),
            store.clone(),
            broadcaster.clone(),
            settings(Duration::ZERO),
            dir.path().to_path_buf(),
            CancellationToken::new(),
        )
        .run(),
    );

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(!dir.path().join("staging").exists());
    assert!(broadcaster.current().files.is_empty());

    engine.set_metadata(content(4));
    engine.make_available(0..4);

    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.state, ControllerState::Complete);
    assert_eq!(summary.frontier, Some(3));
}

#[tokio::test]
async fn periodic_cycles_run_until_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let engine = Arc::new(ScriptedEngine::new(content(8)));
    engine.make_available(0..3);
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(
        OffloadController::new(
            engine.clone(),
            store.clone(),
            ProgressBroadcaster::new(),
            settings(Duration::from_millis(10)),
            dir.path().to_path_buf(),
            cancel.clone(),
        )
        .run(),
    );

    tokio::time::sleep(Duration::from_millis(150)).await;
    cancel.cancel();
    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.state, ControllerState::Downloading);
    assert!(summary.cycles >= 1);
    assert_eq!(summary.uploaded_batches, 1);
    assert_eq!(summary.frontier, Some(2));
    assert!(summary.teardown.is_none());

    let cp = read_checkpoint(&dir.path().join("download_progress.json"))
        .unwrap()
        .unwrap();
    assert_eq!(cp.frontier, Some(2));
}

#[tokio::test]
async fn unreachable_store_at_startup_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    store.set_unreachable(true);

    let err = OffloadController::new(
        Arc::new(ScriptedEngine::new(content(2))),
        store,
        ProgressBroadcaster::new(),
        settings(Duration::ZERO),
        dir.path().to_path_buf(),
        CancellationToken::new(),
    )
    .run()
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Setup { .. }));
}

#[tokio::test]
async fn completion_waits_for_chunks_that_failed_to_stage() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let engine = Arc::new(ScriptedEngine::new(content(4)));
    engine.make_available(0..4);
    engine.stall(2);

    let handle = tokio::spawn(
        OffloadController::new(
            engine.clone(),
            store.clone(),
            ProgressBroadcaster::new(),
            settings(Duration::from_secs(3600)),
            dir.path().to_path_buf(),
            CancellationToken::new(),
        )
        .run(),
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!handle.is_finished());
    assert!(dir.path().join("staging").exists());
    let cp = read_checkpoint(&dir.path().join("download_progress.json"))
        .unwrap()
        .unwrap();
    assert_eq!(cp.frontier, Some(1));
    assert!(!cp.is_uploaded(2));

    engine.unstall(2);
    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.state, ControllerState::Complete);
    assert_eq!(summary.frontier, Some(3));
    assert_eq!(summary.teardown, Some(Teardown::Removed));

    let cp = read_checkpoint(&dir.path().join("download_progress.json"))
        .unwrap()
        .unwrap();
    assert!(cp.is_fully_uploaded());
}
