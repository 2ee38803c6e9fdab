//! Persistent upload/download queue
//!
//! - Items are appended in request order and persisted as one JSON snapshot
//!   after every structural change
//! - A processing pass transfers every `Required` item with at most
//!   `max_concurrent_transfers` in flight, then saves once
//! - Only one pass runs at a time; overlapping calls are skipped

pub mod manager;
pub mod paths;
pub mod store;
pub mod types;
mod worker;

pub use manager::TransferQueue;
pub use types::{
    Direction, PassOutcome, QueueEvent, TransferBatchOperation, TransferItem,
    TransferItemRemoved, TransferKind, TransferPriority, TransferStatus, TransferStatusChanged,
    MAX_CONCURRENT_TRANSFERS,
};
