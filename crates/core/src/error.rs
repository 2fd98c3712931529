use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("archive error: {message}")]
    Archive { message: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("checkpoint frontier regression: {previous:?} -> {next:?}")]
    FrontierRegression {
        previous: Option<u32>,
        next: Option<u32>,
    },

    #[error("setup failed: {message}")]
    Setup { message: String },

    #[error("integrity error: {message}")]
    Integrity { message: String },

    #[error("cancelled")]
    Cancelled,
}
