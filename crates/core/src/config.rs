use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::archive::Compression;
use crate::engine::{ContentFile, ContentInfo};
use crate::pipeline::OffloadSettings;
use crate::uploader::RetryPolicy;
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub content: ContentSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub offload: OffloadTuning,
    #[serde(default)]
    pub observers: ObserverSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentSettings {
    pub name: String,
    pub path: String,
    pub total_bytes: u64,
    pub chunk_size: u64,
    #[serde(default)]
    pub files: Vec<ContentFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Dir,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    pub kind: StoreKind,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    pub repository: String,
    #[serde(default = "default_remote_prefix")]
    pub remote_prefix: String,
    #[serde(default = "default_checkpoint_name")]
    pub checkpoint_name: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffloadTuning {
    pub upload_interval_secs: u64,
    pub status_interval_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub chunk_read_timeout_ms: u64,
    #[serde(default)]
    pub max_batch_chunks: Option<u32>,
    #[serde(default)]
    pub compression: Compression,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverSettings {
    pub listen: String,
    pub channel_capacity: usize,
}

fn default_token_env() -> String {
    "CHUNKFERRY_STORE_TOKEN".to_string()
}

fn default_remote_prefix() -> String {
    "pieces".to_string()
}

fn default_checkpoint_name() -> String {
    "download_progress.json".to_string()
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for ContentSettings {
    fn default() -> Self {
        Self {
            name: "content".to_string(),
            path: "content.bin".to_string(),
            total_bytes: 0,
            chunk_size: 4 * 1024 * 1024,
            files: Vec::new(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            kind: StoreKind::Dir,
            root: Some("remote".to_string()),
            base_url: None,
            token_env: default_token_env(),
            repository: "chunkferry".to_string(),
            remote_prefix: default_remote_prefix(),
            checkpoint_name: default_checkpoint_name(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for OffloadTuning {
    fn default() -> Self {
        Self {
            upload_interval_secs: 60,
            status_interval_ms: 1000,
            max_retries: 3,
            retry_delay_ms: 5000,
            chunk_read_timeout_ms: 10_000,
            max_batch_chunks: None,
            compression: Compression::None,
        }
    }
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8765".to_string(),
            channel_capacity: 16,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            content: ContentSettings::default(),
            store: StoreSettings::default(),
            offload: OffloadTuning::default(),
            observers: ObserverSettings::default(),
        }
    }
}

impl Settings {
    pub fn offload_settings(&self) -> OffloadSettings {
        OffloadSettings {
            upload_interval: Duration::from_secs(self.offload.upload_interval_secs),
            status_interval: Duration::from_millis(self.offload.status_interval_ms),
            retry: RetryPolicy {
                max_retries: self.offload.max_retries,
                delay: Duration::from_millis(self.offload.retry_delay_ms),
            },
            chunk_read_timeout: Duration::from_millis(self.offload.chunk_read_timeout_ms),
            max_batch_chunks: self.offload.max_batch_chunks,
            compression: self.offload.compression,
            repository: self.store.repository.clone(),
            remote_prefix: self.store.remote_prefix.clone(),
            checkpoint_name: self.store.checkpoint_name.clone(),
        }
    }

    /// Content layout; a missing file list means one file named after the content.
    pub fn content_info(&self) -> Result<ContentInfo> {
        let files = if self.content.files.is_empty() {
            vec![ContentFile {
                path: self.content.name.clone(),
                size: self.content.total_bytes,
            }]
        } else {
            self.content.files.clone()
        };
        ContentInfo::new(
            self.content.name.clone(),
            self.content.total_bytes,
            self.content.chunk_size,
            files,
        )
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) => toml::from_str::<Settings>(text),
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom("missing settings version")),
    }
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    validate_settings(settings)?;

    let text = toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })?;

    crate::atomic_file::write_atomic(&config_path(config_dir), text.as_bytes()).map_err(|e| {
        Error::InvalidConfig {
            message: format!("config write failed: {e}"),
        }
    })
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    let invalid = |message: &str| {
        Err(Error::InvalidConfig {
            message: message.to_string(),
        })
    };

    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
                settings.version
            ),
        });
    }

    if settings.content.path.trim().is_empty() {
        return invalid("content.path must not be empty");
    }
    if settings.content.total_bytes == 0 {
        return invalid("content.total_bytes must be > 0");
    }
    if settings.content.chunk_size == 0 {
        return invalid("content.chunk_size must be > 0");
    }
    if !settings.content.files.is_empty() {
        let sum: u64 = settings.content.files.iter().map(|f| f.size).sum();
        if sum != settings.content.total_bytes {
            return Err(Error::InvalidConfig {
                message: format!(
                    "content.files sizes sum to {sum}, expected content.total_bytes = {}",
                    settings.content.total_bytes
                ),
            });
        }
    }

    match settings.store.kind {
        StoreKind::Dir => {
            if settings.store.root.as_deref().is_none_or(|r| r.trim().is_empty()) {
                return invalid("store.root is required for kind = \"dir\"");
            }
        }
        StoreKind::Http => {
            let Some(url) = settings.store.base_url.as_deref() else {
                return invalid("store.base_url is required for kind = \"http\"");
            };
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return invalid("store.base_url must start with http:// or https://");
            }
        }
    }
    if settings.store.repository.trim().is_empty() || settings.store.repository.contains('/') {
        return invalid("store.repository must be a non-empty name without '/'");
    }
    if settings.store.remote_prefix.trim().is_empty() {
        return invalid("store.remote_prefix must not be empty");
    }
    if settings.store.checkpoint_name.trim().is_empty() {
        return invalid("store.checkpoint_name must not be empty");
    }

    let tuning = &settings.offload;
    if tuning.upload_interval_secs == 0 {
        return invalid("offload.upload_interval_secs must be > 0");
    }
    if tuning.status_interval_ms == 0 {
        return invalid("offload.status_interval_ms must be > 0");
    }
    if tuning.max_retries == 0 {
        return invalid("offload.max_retries must be >= 1");
    }
    if tuning.chunk_read_timeout_ms == 0 {
        return invalid("offload.chunk_read_timeout_ms must be > 0");
    }
    if tuning.max_batch_chunks == Some(0) {
        return invalid("offload.max_batch_chunks must be >= 1 when set");
    }

    if settings
        .observers
        .listen
        .parse::<std::net::SocketAddr>()
        .is_err()
    {
        return Err(Error::InvalidConfig {
            message: format!(
                "observers.listen is not a socket address: {}",
                settings.observers.listen
            ),
        });
    }
    if settings.observers.channel_capacity == 0 {
        return invalid("observers.channel_capacity must be >= 1");
    }

    settings.content_info()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> Settings {
        let input = r#"
version = 1

[content]
name = "movie.mkv"
path = "/data/movie.mkv"
total_bytes = 10485760
chunk_size = 1048576

[store]
kind = "dir"
root = "/mnt/remote"
repository = "movie"
"#;
        parse_settings(input).unwrap()
    }

    #[test]
    fn parses_minimal_settings_with_defaults() {
        let s = base_settings();
        validate_settings(&s).unwrap();
        assert_eq!(s.store.remote_prefix, "pieces");
        assert_eq!(s.store.checkpoint_name, "download_progress.json");
        assert_eq!(s.offload.max_retries, 3);
        assert_eq!(s.offload.retry_delay_ms, 5000);
        assert_eq!(s.offload.max_batch_chunks, None);

        let info = s.content_info().unwrap();
        assert_eq!(info.total_chunks, 10);
        assert_eq!(info.files.len(), 1);
        assert_eq!(info.files[0].path, "movie.mkv");
    }

    #[test]
    fn offload_settings_carry_tunables() {
        let mut s = base_settings();
        s.offload.upload_interval_secs = 5 * 3600;
        s.offload.max_batch_chunks = Some(100);
        let o = s.offload_settings();
        assert_eq!(o.upload_interval, Duration::from_secs(18_000));
        assert_eq!(o.max_batch_chunks, Some(100));
        assert_eq!(o.retry.max_retries, 3);
        assert_eq!(o.repository, "movie");
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let err = parse_settings("version = 9\n").unwrap_err();
        assert!(err.to_string().contains("unsupported settings schema version"));
        assert!(parse_settings("[content]\nname = \"x\"\n").is_err());
    }

    #[test]
    fn http_store_requires_base_url() {
        let mut s = base_settings();
        s.store.kind = StoreKind::Http;
        assert!(validate_settings(&s).is_err());
        s.store.base_url = Some("https://store.example/api".to_string());
        validate_settings(&s).unwrap();
    }

    #[test]
    fn zero_tunables_are_rejected() {
        let mut s = base_settings();
        s.offload.max_retries = 0;
        assert!(validate_settings(&s).is_err());

        let mut s = base_settings();
        s.offload.max_batch_chunks = Some(0);
        assert!(validate_settings(&s).is_err());

        let mut s = base_settings();
        s.content.chunk_size = 0;
        assert!(validate_settings(&s).is_err());
    }

    #[test]
    fn file_list_must_cover_total_bytes() {
        let mut s = base_settings();
        s.content.files = vec![
            ContentFile {
                path: "a".to_string(),
                size: 10,
            },
            ContentFile {
                path: "b".to_string(),
                size: 20,
            },
        ];
        assert!(validate_settings(&s).is_err());
        s.content.total_bytes = 30;
        validate_settings(&s).unwrap();
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let s = base_settings();
        save_settings(dir.path(), &s).unwrap();
        let loaded = load_settings(dir.path()).unwrap();
        assert_eq!(loaded.content.path, "/data/movie.mkv");
        assert_eq!(loaded.store.repository, "movie");
    }
}
