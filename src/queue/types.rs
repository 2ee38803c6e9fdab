//! Transfer item model, status definitions and queue event payloads

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Maximum concurrent item transfers within one processing pass
pub const MAX_CONCURRENT_TRANSFERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Download,
    Upload,
}

/// Payload kind: `Page` is text/JSON, `File` is binary (images etc.)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    Page,
    File,
}

/// Item status. Only `Required -> Downloaded` and `Required -> Uploaded` are
/// ever produced; `Requested` and `Failed` exist so older snapshots still load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Required,
    Requested,
    Downloaded,
    Uploaded,
    Failed,
}

/// Metadata only; dispatch order within a pass is list order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransferPriority {
    Critical,
    #[default]
    Normal,
    Low,
}

macro_rules! name_conversions {
    ($ty:ident { $($variant:ident),+ $(,)? }) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $($ty::$variant => f.write_str(stringify!($variant)),)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $(stringify!($variant) => Ok($ty::$variant),)+
                    _ => Err(format!("unknown {}: {}", stringify!($ty), s)),
                }
            }
        }
    };
}

name_conversions!(Direction { Download, Upload });
name_conversions!(TransferKind { Page, File });
name_conversions!(TransferStatus { Required, Requested, Downloaded, Uploaded, Failed });
name_conversions!(TransferPriority { Critical, Normal, Low });

/// One queued download or upload, persisted with the snapshot field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferItem {
    /// Queue-assigned entry id; 0 until the item is queued. Older snapshots
    /// carry none and get fresh ids on load.
    #[serde(rename = "Id", default)]
    pub id: u64,
    #[serde(rename = "Direction")]
    pub direction: Direction,
    #[serde(rename = "Type")]
    pub kind: TransferKind,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Status")]
    pub status: TransferStatus,
    /// Relative to the queue's data directory
    #[serde(rename = "LocalFileSpec")]
    pub local_file_spec: String,
    #[serde(rename = "Priority", default)]
    pub priority: TransferPriority,
}

impl TransferItem {
    pub fn new(
        direction: Direction,
        kind: TransferKind,
        url: &str,
        local_file_spec: String,
        priority: TransferPriority,
    ) -> Self {
        Self {
            id: 0,
            direction,
            kind,
            url: url.to_string(),
            status: TransferStatus::Required,
            local_file_spec,
            priority,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == TransferStatus::Required
    }

    /// Same direction, remote and local file; status is ignored.
    pub fn same_target(&self, other: &TransferItem) -> bool {
        self.direction == other.direction
            && self.url == other.url
            && self.local_file_spec == other.local_file_spec
    }

    /// Terminal status for a successful transfer in this item's direction
    pub fn completed_status(&self) -> TransferStatus {
        match self.direction {
            Direction::Download => TransferStatus::Downloaded,
            Direction::Upload => TransferStatus::Uploaded,
        }
    }
}

/// Status change event payload
#[derive(Debug, Clone, Serialize)]
pub struct TransferStatusChanged {
    pub url: String,
    pub direction: Direction,
    pub status: TransferStatus,
    pub at: i64, // unix millis
}

/// Item removed event payload
#[derive(Debug, Clone, Serialize)]
pub struct TransferItemRemoved {
    pub url: String,
    pub direction: Direction,
}

/// Batch operation event payload
#[derive(Debug, Clone, Serialize)]
pub struct TransferBatchOperation {
    pub operation: String, // "remove_all"
    pub count: usize,
}

/// Observational queue events; nothing in the queue depends on delivery.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    StatusChanged(TransferStatusChanged),
    ItemRemoved(TransferItemRemoved),
    BatchOperation(TransferBatchOperation),
}

/// Outcome of one `process()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// `load()` has not run yet, or the queue was shut down
    NotReady,
    /// Another pass is active; this call was skipped, not deferred
    AlreadyRunning,
    /// No network path at the OS level; nothing attempted
    Offline,
    Completed { attempted: usize, succeeded: usize },
}
