#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use survey_sync::queue::store;
use survey_sync::{Reachability, TransferConfig, TransferItem, TransferQueue};

/// Reachability switch shared between a test and the queue under test
pub fn network(online: bool) -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(online))
}

pub fn as_reachability(flag: &Arc<AtomicBool>) -> Arc<dyn Reachability> {
    Arc::clone(flag) as Arc<dyn Reachability>
}

/// A loaded, empty queue rooted at `dir`
pub async fn loaded_queue(dir: &Path, online: &Arc<AtomicBool>) -> TransferQueue {
    let queue = TransferQueue::new(TransferConfig::with_data_dir(dir), as_reachability(online))
        .expect("build queue");
    queue.load().await.expect("load empty queue");
    queue
}

pub fn read_snapshot_items(queue: &TransferQueue) -> Vec<TransferItem> {
    let raw = std::fs::read(queue.snapshot_path()).expect("snapshot exists");
    store::decode_snapshot(&raw).expect("snapshot decodes")
}
