use net_watch::WatcherConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{TransferError, TransferResult};
use crate::queue::types::MAX_CONCURRENT_TRANSFERS;

/// Snapshot file name inside the data directory
pub const SNAPSHOT_FILE_NAME: &str = "DownloadUploadlist.json";

/// Default per-request timeout (60 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Local data directory; item paths and the snapshot live here
    pub data_dir: PathBuf,
    pub snapshot_file_name: String,
    pub max_concurrent_transfers: usize,
    pub request_timeout_ms: u64,
    pub user_agent: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            snapshot_file_name: SNAPSHOT_FILE_NAME.to_string(),
            max_concurrent_transfers: MAX_CONCURRENT_TRANSFERS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            user_agent: format!("survey-sync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl TransferConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(&self.snapshot_file_name)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Worker slots; never zero so a pass can always make progress
    pub fn worker_slots(&self) -> usize {
        self.max_concurrent_transfers.max(1)
    }

    pub fn from_json_file(path: &Path) -> TransferResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| TransferError::io(path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Queue and watcher settings for the composed service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub transfer: TransferConfig,
    pub watcher: WatcherConfig,
}

impl ServiceConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            transfer: TransferConfig::with_data_dir(data_dir),
            watcher: WatcherConfig::default(),
        }
    }

    pub fn from_json_file(path: &Path) -> TransferResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| TransferError::io(path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }
}
