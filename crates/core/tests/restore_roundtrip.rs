use std::sync::Arc;
use std::time::Duration;

use chunkferry_core::{
    ArchiveHeader, Compression, ContentFile, ContentInfo, DirStore, Error, InMemoryStore,
    OffloadPipeline, OffloadSettings, RemoteStore, RestoreOptions, RetryPolicy, ScriptedEngine,
    read_archive_header, restore_content,
};
use tokio_util::sync::CancellationToken;

fn content() -> ContentInfo {
    // Last chunk is short.
    ContentInfo::new(
        "content".to_string(),
        38,
        4,
        vec![ContentFile {
            path: "content.bin".to_string(),
            size: 38,
        }],
    )
    .unwrap()
}

fn expected_bytes(info: &ContentInfo) -> Vec<u8> {
    (0..info.total_chunks)
        .flat_map(|i| ScriptedEngine::pattern(i, info.chunk_len(i)))
        .collect()
}

fn settings(compression: Compression) -> OffloadSettings {
    OffloadSettings {
        compression,
        max_batch_chunks: Some(4),
        retry: RetryPolicy {
            max_retries: 1,
            delay: Duration::from_millis(1),
        },
        ..OffloadSettings::default()
    }
}

async fn offload_all(
    store: Arc<dyn RemoteStore>,
    data_dir: &std::path::Path,
    compression: Compression,
) -> OffloadPipeline {
    let info = content();
    let engine = Arc::new(ScriptedEngine::new(info.clone()));
    engine.make_available(0..info.total_chunks);
    let repo = store.ensure_repository("chunkferry").await.unwrap();
    let mut pipeline = OffloadPipeline::open(
        engine,
        store,
        repo,
        &settings(compression),
        data_dir,
        info,
    )
    .await
    .unwrap();
    pipeline.run_cycle(&CancellationToken::new()).await;
    pipeline
}

#[tokio::test]
async fn offloaded_content_reassembles_byte_for_byte() {
    for compression in [Compression::None, Compression::Zstd] {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn RemoteStore> = Arc::new(DirStore::new(dir.path().join("remote")));
        let pipeline = offload_all(store.clone(), &dir.path().join("data"), compression).await;
        let checkpoint = pipeline.checkpoint().clone();
        assert_eq!(checkpoint.archives.len(), 3);

        let repo = store.ensure_repository("chunkferry").await.unwrap();
        let output = dir.path().join("out").join("content.bin");
        let result = restore_content(
            store.as_ref(),
            &repo,
            &checkpoint,
            &output,
            RestoreOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.archives_downloaded, 3);
        assert_eq!(result.chunks_written, 10);
        assert_eq!(result.bytes_written, 38);
        assert!(result.missing.is_empty());
        assert_eq!(std::fs::read(&output).unwrap(), expected_bytes(&content()));
    }
}

#[tokio::test]
async fn corrupted_archive_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let mem = Arc::new(InMemoryStore::new());
    let pipeline = offload_all(mem.clone(), dir.path(), Compression::None).await;
    let checkpoint = pipeline.checkpoint().clone();

    let first = &checkpoint.archives[0].path;
    let mut bytes = mem.get("chunkferry", first).unwrap();
    bytes[0] ^= 0xff;
    mem.put("chunkferry", first, bytes);

    let repo = mem.ensure_repository("chunkferry").await.unwrap();
    let err = restore_content(
        mem.as_ref(),
        &repo,
        &checkpoint,
        &dir.path().join("restored.bin"),
        RestoreOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Integrity { .. }));
}

#[tokio::test]
async fn partial_checkpoint_reports_missing_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let mem = Arc::new(InMemoryStore::new());
    let pipeline = offload_all(mem.clone(), dir.path(), Compression::Zstd).await;
    let mut checkpoint = pipeline.checkpoint().clone();
    checkpoint.archives.retain(|a| a.start != 4);

    let repo = mem.ensure_repository("chunkferry").await.unwrap();
    let result = restore_content(
        mem.as_ref(),
        &repo,
        &checkpoint,
        &dir.path().join("restored.bin"),
        RestoreOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(result.missing, vec![4, 5, 6, 7]);
    assert_eq!(result.chunks_written, 6);
}

#[tokio::test]
async fn cancelled_restore_stops_early() {
    let dir = tempfile::tempdir().unwrap();
    let mem = Arc::new(InMemoryStore::new());
    let pipeline = offload_all(mem.clone(), dir.path(), Compression::None).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let repo = mem.ensure_repository("chunkferry").await.unwrap();
    let err = restore_content(
        mem.as_ref(),
        &repo,
        pipeline.checkpoint(),
        &dir.path().join("restored.bin"),
        RestoreOptions {
            cancel: Some(&cancel),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

/// Replaces the JSON header of an archive, keeping its payload.
fn with_header(bytes: &[u8], header: &ArchiveHeader) -> Vec<u8> {
    let mut trailer = [0u8; 4];
    trailer.copy_from_slice(&bytes[bytes.len() - 4..]);
    let payload_end = bytes.len() - 4 - u32::from_le_bytes(trailer) as usize;
    let json = serde_json::to_vec(header).unwrap();
    let mut out = bytes[..payload_end].to_vec();
    out.extend_from_slice(&json);
    out.extend_from_slice(&(json.len() as u32).to_le_bytes());
    out
}

#[tokio::test]
async fn archive_entries_outside_their_range_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mem = Arc::new(InMemoryStore::new());
    let pipeline = offload_all(mem.clone(), dir.path(), Compression::None).await;
    let checkpoint = pipeline.checkpoint().clone();
    let first = checkpoint.archives[0].path.clone();
    let original = mem.get("chunkferry", &first).unwrap();
    let repo = mem.ensure_repository("chunkferry").await.unwrap();

    let mut moved = read_archive_header(&original).unwrap();
    moved.entries[1].index = 9;
    let mut duplicated = read_archive_header(&original).unwrap();
    duplicated.entries[1].index = duplicated.entries[0].index;
    let mut short = read_archive_header(&original).unwrap();
    short.entries.pop();

    for header in [moved, duplicated, short] {
        mem.put("chunkferry", &first, with_header(&original, &header));
        let err = restore_content(
            mem.as_ref(),
            &repo,
            &checkpoint,
            &dir.path().join("restored.bin"),
            RestoreOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }), "{err:?}");
    }
}
