use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::{StoreKind, StoreSettings};
use crate::{Error, Result};

pub type StoreFuture<'a, T> =
    Pin<Box<dyn Future<Output = std::result::Result<T, StoreError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unreachable: {message}")]
    Unreachable { message: String },

    #[error("store rejected request: {message}")]
    Rejected { message: String },

    #[error("store request timed out")]
    Timeout,

    #[error("artifact not found: {path}")]
    NotFound { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoHandle {
    pub id: String,
    pub location: String,
}

/// Remote artifact store. Paths are relative to the repository returned by
/// [`RemoteStore::ensure_repository`].
pub trait RemoteStore: Send + Sync {
    fn provider(&self) -> &str;

    /// Idempotent: creates the repository when absent.
    fn ensure_repository<'a>(&'a self, id: &'a str) -> StoreFuture<'a, RepoHandle>;

    fn upload_artifact<'a>(
        &'a self,
        repo: &'a RepoHandle,
        local_path: &'a Path,
        remote_path: &'a str,
    ) -> StoreFuture<'a, ()>;

    fn download_artifact<'a>(
        &'a self,
        repo: &'a RepoHandle,
        remote_path: &'a str,
    ) -> StoreFuture<'a, Vec<u8>>;
}

pub fn open_store(settings: &StoreSettings) -> Result<Arc<dyn RemoteStore>> {
    match settings.kind {
        StoreKind::Dir => {
            let root = settings.root.as_ref().ok_or_else(|| Error::InvalidConfig {
                message: "store.root is required for kind = \"dir\"".to_string(),
            })?;
            Ok(Arc::new(DirStore::new(PathBuf::from(root))))
        }
        StoreKind::Http => {
            let base_url = settings
                .base_url
                .as_ref()
                .ok_or_else(|| Error::InvalidConfig {
                    message: "store.base_url is required for kind = \"http\"".to_string(),
                })?;
            let token = std::env::var(&settings.token_env)
                .ok()
                .filter(|t| !t.trim().is_empty());
            Ok(Arc::new(HttpStore::new(HttpStoreConfig {
                base_url: base_url.clone(),
                token,
                request_timeout: Duration::from_secs(settings.request_timeout_secs),
            })?))
        }
    }
}

fn validate_remote_path(remote_path: &str) -> std::result::Result<(), StoreError> {
    let bad = remote_path.is_empty()
        || remote_path.starts_with('/')
        || remote_path.split('/').any(|c| c.is_empty() || c == "..");
    if bad {
        return Err(StoreError::Rejected {
            message: format!("invalid remote path: {remote_path:?}"),
        });
    }
    Ok(())
}

/// Mirrors artifacts into a local (or mounted) directory tree.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn repo_dir(&self, repo: &RepoHandle) -> PathBuf {
        self.root.join(&repo.id)
    }
}

impl RemoteStore for DirStore {
    fn provider(&self) -> &str {
        "dir"
    }

    fn ensure_repository<'a>(&'a self, id: &'a str) -> StoreFuture<'a, RepoHandle> {
        Box::pin(async move {
            validate_remote_path(id)?;
            let dir = self.root.join(id);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| StoreError::Unreachable {
                    message: format!("create {}: {e}", dir.display()),
                })?;
            Ok(RepoHandle {
                id: id.to_string(),
                location: dir.display().to_string(),
            })
        })
    }

    fn upload_artifact<'a>(
        &'a self,
        repo: &'a RepoHandle,
        local_path: &'a Path,
        remote_path: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            validate_remote_path(remote_path)?;
            let dest = self.repo_dir(repo).join(remote_path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Unreachable {
                        message: format!("create {}: {e}", parent.display()),
                    })?;
            }
            let tmp = dest.with_extension("upload.tmp");
            tokio::fs::copy(local_path, &tmp)
                .await
                .map_err(|e| StoreError::Unreachable {
                    message: format!("copy {}: {e}", local_path.display()),
                })?;
            tokio::fs::rename(&tmp, &dest)
                .await
                .map_err(|e| StoreError::Unreachable {
                    message: format!("rename {}: {e}", dest.display()),
                })?;
            Ok(())
        })
    }

    fn download_artifact<'a>(
        &'a self,
        repo: &'a RepoHandle,
        remote_path: &'a str,
    ) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            validate_remote_path(remote_path)?;
            let path = self.repo_dir(repo).join(remote_path);
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                    path: remote_path.to_string(),
                }),
                Err(e) => Err(StoreError::Unreachable {
                    message: format!("read {}: {e}", path.display()),
                }),
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
}

/// Object store speaking plain HTTP: `PUT`/`GET` of `{base_url}/{repo}/{path}`, repository
/// creation by `PUT {base_url}/{repo}/`.
pub struct HttpStore {
    config: HttpStoreConfig,
    client: reqwest::Client,
}

impl HttpStore {
    pub fn new(config: HttpStoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::InvalidConfig {
                message: format!("http client build failed: {e}"),
            })?;
        Ok(Self { config, client })
    }

    fn url(&self, repo_id: &str, remote_path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            repo_id,
            remote_path
        )
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

fn map_request_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::Unreachable {
            message: format!("request failed: {e}"),
        }
    }
}

fn map_status(status: reqwest::StatusCode, body: &str) -> StoreError {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        StoreError::Unreachable {
            message: format!("http {status}: {body}"),
        }
    } else {
        StoreError::Rejected {
            message: format!("http {status}: {body}"),
        }
    }
}

impl RemoteStore for HttpStore {
    fn provider(&self) -> &str {
        "http"
    }

    fn ensure_repository<'a>(&'a self, id: &'a str) -> StoreFuture<'a, RepoHandle> {
        Box::pin(async move {
            validate_remote_path(id)?;
            let url = self.url(id, "");
            let res = self
                .authorize(self.client.put(&url))
                .send()
                .await
                .map_err(map_request_error)?;
            let status = res.status();
            if !status.is_success() && status != reqwest::StatusCode::CONFLICT {
                let body = res.text().await.unwrap_or_default();
                return Err(map_status(status, &body));
            }
            Ok(RepoHandle {
                id: id.to_string(),
                location: url,
            })
        })
    }

    fn upload_artifact<'a>(
        &'a self,
        repo: &'a RepoHandle,
        local_path: &'a Path,
        remote_path: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            validate_remote_path(remote_path)?;
            let bytes = tokio::fs::read(local_path)
                .await
                .map_err(|e| StoreError::Rejected {
                    message: format!("read {}: {e}", local_path.display()),
                })?;
            let res = self
                .authorize(self.client.put(self.url(&repo.id, remote_path)))
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(bytes)
                .send()
                .await
                .map_err(map_request_error)?;
            let status = res.status();
            if !status.is_success() {
                let body = res.text().await.unwrap_or_default();
                return Err(map_status(status, &body));
            }
            Ok(())
        })
    }

    fn download_artifact<'a>(
        &'a self,
        repo: &'a RepoHandle,
        remote_path: &'a str,
    ) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            validate_remote_path(remote_path)?;
            let res = self
                .authorize(self.client.get(self.url(&repo.id, remote_path)))
                .send()
                .await
                .map_err(map_request_error)?;
            let status = res.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(StoreError::NotFound {
                    path: remote_path.to_string(),
                });
            }
            if !status.is_success() {
                let body = res.text().await.unwrap_or_default();
                return Err(map_status(status, &body));
            }
            let bytes = res.bytes().await.map_err(map_request_error)?;
            Ok(bytes.to_vec())
        })
    }
}

/// Test double with failure injection.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    pub uploaded: AtomicUsize,
    pub upload_attempts: AtomicUsize,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    upload_log: Mutex<Vec<String>>,
    faults: Mutex<Faults>,
}

#[derive(Debug, Default)]
struct Faults {
    unreachable: bool,
    fail_next_uploads: usize,
    reject_paths_containing: Vec<String>,
    fail_downloads: bool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(repo: &RepoHandle, remote_path: &str) -> String {
        format!("{}/{}", repo.id, remote_path)
    }

    /// Makes every store call fail with `Unreachable` until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.faults_lock().unreachable = unreachable;
    }

    pub fn fail_next_uploads(&self, n: usize) {
        self.faults_lock().fail_next_uploads = n;
    }

    pub fn reject_paths_containing(&self, needle: &str) {
        self.faults_lock()
            .reject_paths_containing
            .push(needle.to_string());
    }

    pub fn clear_faults(&self) {
        *self.faults_lock() = Faults::default();
    }

    pub fn set_fail_downloads(&self, fail: bool) {
        self.faults_lock().fail_downloads = fail;
    }

    pub fn get(&self, repo_id: &str, remote_path: &str) -> Option<Vec<u8>> {
        self.objects_lock()
            .get(&format!("{repo_id}/{remote_path}"))
            .cloned()
    }

    pub fn put(&self, repo_id: &str, remote_path: &str, bytes: Vec<u8>) {
        self.objects_lock()
            .insert(format!("{repo_id}/{remote_path}"), bytes);
    }

    /// Remote paths of successful uploads, in order.
    pub fn uploaded_paths(&self) -> Vec<String> {
        self.upload_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn faults_lock(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn objects_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RemoteStore for InMemoryStore {
    fn provider(&self) -> &str {
        "test.mem"
    }

    fn ensure_repository<'a>(&'a self, id: &'a str) -> StoreFuture<'a, RepoHandle> {
        Box::pin(async move {
            if self.faults_lock().unreachable {
                return Err(StoreError::Unreachable {
                    message: "in-memory store marked unreachable".to_string(),
                });
            }
            Ok(RepoHandle {
                id: id.to_string(),
                location: format!("mem:{id}"),
            })
        })
    }

    fn upload_artifact<'a>(
        &'a self,
        repo: &'a RepoHandle,
        local_path: &'a Path,
        remote_path: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.upload_attempts.fetch_add(1, Ordering::Relaxed);
            {
                let mut faults = self.faults_lock();
                if faults.unreachable {
                    return Err(StoreError::Unreachable {
                        message: "in-memory store marked unreachable".to_string(),
                    });
                }
                if faults.fail_next_uploads > 0 {
                    faults.fail_next_uploads -= 1;
                    return Err(StoreError::Timeout);
                }
                if faults
                    .reject_paths_containing
                    .iter()
                    .any(|n| remote_path.contains(n.as_str()))
                {
                    return Err(StoreError::Rejected {
                        message: format!("rejected {remote_path}"),
                    });
                }
            }

            let bytes = tokio::fs::read(local_path)
                .await
                .map_err(|e| StoreError::Rejected {
                    message: format!("read {}: {e}", local_path.display()),
                })?;
            self.objects_lock()
                .insert(Self::key(repo, remote_path), bytes);
            self.upload_log
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(remote_path.to_string());
            self.uploaded.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn download_artifact<'a>(
        &'a self,
        repo: &'a RepoHandle,
        remote_path: &'a str,
    ) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            {
                let faults = self.faults_lock();
                if faults.unreachable || faults.fail_downloads {
                    return Err(StoreError::Unreachable {
                        message: "in-memory store download failure".to_string(),
                    });
                }
            }
            self.objects_lock()
                .get(&Self::key(repo, remote_path))
                .cloned()
                .ok_or_else(|| StoreError::NotFound {
                    path: remote_path.to_string(),
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dir_store_upload_download_and_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path().join("remote"));
        let repo = store.ensure_repository("content").await.unwrap();
        // Second call is a no-op.
        store.ensure_repository("content").await.unwrap();

        let local = dir.path().join("a.pack");
        std::fs::write(&local, b"payload").unwrap();
        store
            .upload_artifact(&repo, &local, "pieces/a.pack")
            .await
            .unwrap();

        let got = store.download_artifact(&repo, "pieces/a.pack").await.unwrap();
        assert_eq!(got, b"payload");

        let missing = store.download_artifact(&repo, "pieces/b.pack").await;
        assert_eq!(
            missing,
            Err(StoreError::NotFound {
                path: "pieces/b.pack".to_string()
            })
        );
    }

    #[tokio::test]
    async fn remote_paths_cannot_escape_repository() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path().to_path_buf());
        let repo = store.ensure_repository("content").await.unwrap();
        let local = dir.path().join("x");
        std::fs::write(&local, b"x").unwrap();

        for bad in ["../x", "/abs", "a//b", ""] {
            let res = store.upload_artifact(&repo, &local, bad).await;
            assert!(matches!(res, Err(StoreError::Rejected { .. })), "{bad}");
        }
    }

    #[tokio::test]
    async fn in_memory_store_fault_injection() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a");
        std::fs::write(&local, b"abc").unwrap();

        let store = InMemoryStore::new();
        let repo = store.ensure_repository("r").await.unwrap();

        store.fail_next_uploads(1);
        assert_eq!(
            store.upload_artifact(&repo, &local, "p/a").await,
            Err(StoreError::Timeout)
        );
        store.upload_artifact(&repo, &local, "p/a").await.unwrap();
        assert_eq!(store.upload_attempts.load(Ordering::Relaxed), 2);
        assert_eq!(store.uploaded.load(Ordering::Relaxed), 1);
        assert_eq!(store.get("r", "p/a"), Some(b"abc".to_vec()));

        store.reject_paths_containing("bad");
        assert!(matches!(
            store.upload_artifact(&repo, &local, "p/bad").await,
            Err(StoreError::Rejected { .. })
        ));
        assert_eq!(store.uploaded_paths(), vec!["p/a".to_string()]);
    }
}
