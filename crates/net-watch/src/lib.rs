//! Network reachability polling with single-flight reactions
//!
//! - `Reachability`: best-effort "is a network path available" primitive
//! - `ConnectivityWatcher`: samples reachability on a fixed interval and runs
//!   every registered action at most once concurrently

pub mod reachability;
pub mod watcher;

pub use reachability::{Reachability, RouteProbe, DEFAULT_PROBE_ADDRS};
pub use watcher::{
    ActionPriority, ActionResult, ConnectivityWatcher, RegisteredAction, WatcherConfig,
    DEFAULT_DISPOSE_GRACE_MS, DEFAULT_POLL_INTERVAL_MS,
};
