use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::broadcast::ProgressBroadcaster;
use crate::engine::TransferEngine;
use crate::pipeline::{OffloadPipeline, OffloadSettings, Teardown};
use crate::progress::ProgressSnapshot;
use crate::store::RemoteStore;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    AwaitingMetadata,
    Downloading,
    Complete,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingMetadata => "awaiting_metadata",
            Self::Downloading => "downloading",
            Self::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffloadSummary {
    pub state: ControllerState,
    pub cycles: usize,
    pub uploaded_batches: usize,
    pub frontier: Option<u32>,
    pub teardown: Option<Teardown>,
    pub cancelled: bool,
}

pub struct OffloadController {
    engine: Arc<dyn TransferEngine>,
    store: Arc<dyn RemoteStore>,
    broadcaster: ProgressBroadcaster,
    settings: OffloadSettings,
    data_dir: PathBuf,
    cancel: CancellationToken,
}

impl OffloadController {
    pub fn new(
        engine: Arc<dyn TransferEngine>,
        store: Arc<dyn RemoteStore>,
        broadcaster: ProgressBroadcaster,
        settings: OffloadSettings,
        data_dir: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            store,
            broadcaster,
            settings,
            data_dir,
            cancel,
        }
    }

    fn publish_status(&self) {
        let snapshot = ProgressSnapshot::from_stats(&self.engine.overall_stats());
        let report = self.broadcaster.publish(snapshot);
        if report.removed > 0 || report.dropped > 0 {
            tracing::debug!(
                event = "broadcast.tick",
                delivered = report.delivered,
                dropped = report.dropped,
                removed = report.removed,
                "status published"
            );
        }
    }

    fn transition(state: &mut ControllerState, next: ControllerState) {
        tracing::info!(
            event = "controller.state",
            from = state.as_str(),
            to = next.as_str(),
            "controller state changed"
        );
        *state = next;
    }

    /// Runs until the engine completes and every chunk is uploaded and checkpointed, or until
    /// cancelled.
    ///
    /// Fails only on setup problems: an unreachable store at startup, local directories that
    /// cannot be created, or a checkpoint for different content.
    pub async fn run(self) -> Result<OffloadSummary> {
        let repo = self
            .store
            .ensure_repository(&self.settings.repository)
            .await
            .map_err(|e| Error::Setup {
                message: format!(
                    "ensure repository {} on {}: {e}",
                    self.settings.repository,
                    self.store.provider()
                ),
            })?;

        let mut state = ControllerState::AwaitingMetadata;
        tracing::info!(
            event = "controller.state",
            to = state.as_str(),
            repository = %repo.location,
            "controller started"
        );

        let mut summary = OffloadSummary {
            state,
            cycles: 0,
            uploaded_batches: 0,
            frontier: None,
            teardown: None,
            cancelled: false,
        };

        let mut ticker =
            tokio::time::interval(self.settings.status_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pipeline: Option<OffloadPipeline> = None;
        let mut last_offload = Instant::now();
        let mut draining = false;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                _ = ticker.tick() => {}
            }

            self.publish_status();

            if pipeline.is_none() {
                let Some(info) = self.engine.content_info() else {
                    continue;
                };
                let opened = OffloadPipeline::open(
                    Arc::clone(&self.engine),
                    Arc::clone(&self.store),
                    repo.clone(),
                    &self.settings,
                    &self.data_dir,
                    info,
                )
                .await?;
                summary.frontier = opened.checkpoint().frontier;
                last_offload = Instant::now();
                Self::transition(&mut state, ControllerState::Downloading);
                pipeline = Some(opened);
            }
            let Some(p) = pipeline.as_mut() else {
                continue;
            };

            let complete = self.engine.is_complete();
            if !complete && last_offload.elapsed() < self.settings.upload_interval {
                continue;
            }

            let report = p.run_cycle(&self.cancel).await;
            last_offload = Instant::now();
            summary.cycles += 1;
            summary.uploaded_batches += report.uploaded.len();
            summary.frontier = report.frontier;
            if report.cancelled {
                summary.cancelled = true;
                break;
            }

            if !complete {
                continue;
            }
            if !p.is_finished() {
                // Stay on the per-tick cadence until the last chunks and the checkpoint land.
                if !draining {
                    draining = true;
                    tracing::warn!(
                        event = "controller.draining",
                        staged = p.staged().len(),
                        pending = p.pending_batches().len(),
                        checkpoint_dirty = p.is_checkpoint_dirty(),
                        "engine complete but offload not finished; retrying every tick"
                    );
                }
                continue;
            }
            summary.teardown = Some(p.teardown()?);
            Self::transition(&mut state, ControllerState::Complete);
            self.publish_status();
            break;
        }

        summary.state = state;
        tracing::info!(
            event = "controller.stopped",
            state = state.as_str(),
            cycles = summary.cycles,
            uploaded_batches = summary.uploaded_batches,
            frontier = ?summary.frontier,
            cancelled = summary.cancelled,
            "controller stopped"
        );
        Ok(summary)
    }
}
