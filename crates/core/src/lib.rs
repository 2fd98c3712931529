mod archive;
mod batch;
mod broadcast;
mod checkpoint;
mod controller;
mod engine;
mod error;
mod pipeline;
mod progress;
mod restore;
mod stager;
mod store;
mod uploader;

pub mod atomic_file;
pub mod config;
pub mod run_log;

pub use run_log::RunKind;

pub const APP_NAME: &str = "chunkferry";

pub use archive::{
    ArchiveEntry, ArchiveHeader, ArchiveWriter, Compression, extract_chunk, read_archive_header,
};
pub use batch::{Batch, BatchBuilder, SealedBatch, archive_path, build_batches, parse_archive_name};
pub use broadcast::{ObserverId, ProgressBroadcaster, PublishReport, SnapshotSender, Subscription};
pub use checkpoint::{
    ArchiveRecord, Checkpoint, CheckpointStore, TIMESTAMP_FORMAT, read_checkpoint, utc_timestamp,
};
pub use controller::{ControllerState, OffloadController, OffloadSummary};
pub use engine::{
    ContentFile, ContentInfo, EngineFuture, EngineStats, FileEngine, FileProgress, ReadError,
    ScriptedEngine, TransferEngine,
};
pub use error::{Error, Result};
pub use pipeline::{
    ARCHIVE_DIR, CycleReport, OffloadPipeline, OffloadSettings, RecoveryReport, STAGING_DIR,
    Teardown,
};
pub use progress::{FileStatus, ProgressSnapshot};
pub use restore::{RestoreOptions, RestoreResult, restore_content};
pub use stager::{ChunkStager, StageError, parse_staged_chunk_name, staged_chunk_path};
pub use store::{
    DirStore, HttpStore, HttpStoreConfig, InMemoryStore, RemoteStore, RepoHandle, StoreError,
    StoreFuture, open_store,
};
pub use uploader::{RetryPolicy, UploadFailure, Uploader};
