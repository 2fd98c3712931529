use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::batch::{Batch, SealedBatch};
use crate::store::{RemoteStore, RepoHandle, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts per upload, including the first one.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadFailure {
    #[error("upload abandoned after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: StoreError },

    #[error("upload cancelled")]
    Cancelled,
}

pub struct Uploader {
    store: Arc<dyn RemoteStore>,
    repo: RepoHandle,
    remote_prefix: String,
    policy: RetryPolicy,
}

impl Uploader {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        repo: RepoHandle,
        remote_prefix: String,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            repo,
            remote_prefix,
            policy,
        }
    }

    pub fn remote_path(&self, batch: Batch) -> String {
        let prefix = self.remote_prefix.trim_matches('/');
        if prefix.is_empty() {
            batch.name()
        } else {
            format!("{prefix}/{}", batch.name())
        }
    }

    /// Uploads a sealed archive, retrying with a fixed delay. Returns the remote path.
    ///
    /// The local archive is removed only after the store confirmed the upload; on any failure it
    /// stays on disk for the next cycle.
    pub async fn upload(
        &self,
        sealed: &SealedBatch,
        cancel: &CancellationToken,
    ) -> Result<String, UploadFailure> {
        let remote = self.remote_path(sealed.batch);
        let attempts = self.policy.max_retries.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(UploadFailure::Cancelled);
            }

            let res = tokio::select! {
                _ = cancel.cancelled() => return Err(UploadFailure::Cancelled),
                res = self.store.upload_artifact(&self.repo, &sealed.path, &remote) => res,
            };

            match res {
                Ok(()) => break,
                Err(e) if attempt >= attempts => {
                    tracing::warn!(
                        event = "upload.abandoned",
                        batch = %sealed.batch,
                        attempts = attempt,
                        error = %e,
                        "upload abandoned for this cycle"
                    );
                    return Err(UploadFailure::Exhausted { attempts: attempt, last: e });
                }
                Err(e) => {
                    tracing::warn!(
                        event = "upload.retry",
                        batch = %sealed.batch,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = self.policy.delay.as_millis() as u64,
                        error = %e,
                        "upload failed; retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(UploadFailure::Cancelled),
                        _ = tokio::time::sleep(self.policy.delay) => {}
                    }
                }
            }
        }

        if let Err(e) = tokio::fs::remove_file(&sealed.path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(
                event = "upload.local_cleanup_failed",
                path = %sealed.path.display(),
                error = %e,
                "uploaded archive could not be removed"
            );
        }

        tracing::info!(
            event = "upload.ok",
            batch = %sealed.batch,
            attempts = attempt,
            remote_path = %remote,
            "batch uploaded"
        );
        Ok(remote)
    }
}
