use std::path::PathBuf;

pub type TransferResult<T> = Result<T, TransferError>;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported transfer kind for {0}")]
    UnsupportedKind(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server responded {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("response body for {url} is not valid text: {reason}")]
    InvalidBody { url: String, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("snapshot schema version {found} is newer than supported {supported}")]
    SchemaVersion { found: u32, supported: u32 },

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TransferError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for failures that leave the item `Required` for the next pass.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::Http(_)
                | TransferError::Status { .. }
                | TransferError::InvalidBody { .. }
                | TransferError::Io { .. }
                | TransferError::Cancelled
        )
    }
}
