//! Wires the transfer queue to the connectivity watcher

use log::{error, info};
use net_watch::{ActionPriority, ConnectivityWatcher, Reachability};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::ServiceConfig;
use crate::error::TransferResult;
use crate::queue::{PassOutcome, TransferItem, TransferKind, TransferPriority, TransferQueue};

/// Name of the watcher action that drains the queue
pub const PROCESS_ACTION_NAME: &str = "process_transfer_queue";

/// A loaded queue plus a running watcher that starts a pass on every
/// online tick.
pub struct TransferService {
    queue: TransferQueue,
    watcher: ConnectivityWatcher,
}

impl TransferService {
    /// Build and load the queue, then start polling. A snapshot that fails to
    /// load is logged and the service starts with an empty queue.
    pub async fn start(
        config: ServiceConfig,
        reachability: Arc<dyn Reachability>,
    ) -> TransferResult<Self> {
        let queue = TransferQueue::new(config.transfer, Arc::clone(&reachability))?;
        if let Err(e) = queue.load().await {
            error!("service_start: queue load failed, starting empty error={}", e);
        }

        let watcher = ConnectivityWatcher::start(config.watcher, reachability);
        let action_queue = queue.clone();
        watcher.register_action(PROCESS_ACTION_NAME, ActionPriority::Normal, move |online| {
            let queue = action_queue.clone();
            async move {
                if online {
                    queue.process().await;
                }
                Ok(())
            }
        });

        info!("service_started: data_dir={}", queue.config().data_dir.display());
        Ok(Self { queue, watcher })
    }

    pub fn queue(&self) -> &TransferQueue {
        &self.queue
    }

    pub fn watcher(&self) -> &ConnectivityWatcher {
        &self.watcher
    }

    /// Queue a page download and start a pass right away instead of waiting
    /// for the next tick.
    pub async fn enqueue_page_for_later(
        &self,
        url: &str,
    ) -> Option<(TransferItem, JoinHandle<PassOutcome>)> {
        let item = self
            .queue
            .add_download_request(TransferKind::Page, url, TransferPriority::Normal)
            .await?;
        Some((item, self.queue.spawn_process()))
    }

    /// Stop the watcher first so no new pass starts, then drain the queue.
    pub async fn shutdown(&self, timeout: Duration) {
        self.watcher.dispose().await;
        self.queue.shutdown(timeout).await;
        info!("service_shutdown: done");
    }
}
