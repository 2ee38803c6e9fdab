//! Resilient transfer subsystem for offline-first clients
//!
//! A durable upload/download queue (`queue`) processed in bounded-parallel
//! passes, and a connectivity watcher (re-exported from `net_watch`) that
//! kicks a pass whenever a network path is available.

pub mod config;
pub mod error;
pub mod queue;
pub mod service;

pub use config::{ServiceConfig, TransferConfig};
pub use error::{TransferError, TransferResult};
pub use net_watch::{
    ActionPriority, ActionResult, ConnectivityWatcher, Reachability, RouteProbe, WatcherConfig,
};
pub use queue::{
    Direction, PassOutcome, QueueEvent, TransferItem, TransferKind, TransferPriority,
    TransferQueue, TransferStatus,
};
pub use service::TransferService;
