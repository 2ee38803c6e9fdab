//! Transfer queue - durable item list plus bounded-parallelism processing passes

use chrono::Utc;
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use net_watch::Reachability;
use reqwest::Client;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, MutexGuard, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::paths;
use super::store;
use super::types::{
    Direction, PassOutcome, QueueEvent, TransferBatchOperation, TransferItem,
    TransferItemRemoved, TransferKind, TransferPriority, TransferStatusChanged,
};
use super::worker;
use crate::config::TransferConfig;
use crate::error::{TransferError, TransferResult};

/// Queue events buffered per subscriber before the oldest are dropped
const EVENT_CHANNEL_CAPACITY: usize = 64;

struct QueueInner {
    config: TransferConfig,
    snapshot_path: PathBuf,
    // Single-writer boundary: every structural change and every snapshot
    // write happens under this lock.
    items: Mutex<Vec<TransferItem>>,
    next_id: AtomicU64,
    ready: AtomicBool,
    shut_down: AtomicBool,
    // true while a processing pass is active
    pass_active: watch::Sender<bool>,
    client: Client,
    limiter: Arc<Semaphore>,
    reachability: Arc<dyn Reachability>,
    cancel: CancellationToken,
    events: broadcast::Sender<QueueEvent>,
}

/// Releases the single-flight flag however the pass ends.
struct PassGuard<'a> {
    flag: &'a watch::Sender<bool>,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.flag.send_replace(false);
    }
}

impl QueueInner {
    fn begin_pass(&self) -> Option<PassGuard<'_>> {
        let claimed = self.pass_active.send_if_modified(|active| {
            if *active {
                return false;
            }
            *active = true;
            true
        });
        claimed.then_some(PassGuard {
            flag: &self.pass_active,
        })
    }

    fn assign_id(&self, item: &mut TransferItem) {
        item.id = self.next_id.fetch_add(1, Ordering::SeqCst);
    }

    /// Keep loaded ids, give fresh ones to entries without a usable id, and
    /// move the counter past everything in the list.
    fn reconcile_ids(&self, items: &mut [TransferItem]) -> usize {
        let highest = items.iter().map(|item| item.id).max().unwrap_or(0);
        self.next_id
            .fetch_max(highest.saturating_add(1), Ordering::SeqCst);

        let mut seen = HashSet::new();
        let mut reassigned = 0;
        for item in items.iter_mut() {
            if item.id == 0 || !seen.insert(item.id) {
                self.assign_id(item);
                seen.insert(item.id);
                reassigned += 1;
            }
        }
        reassigned
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    fn emit_status(&self, item: &TransferItem) {
        self.emit(QueueEvent::StatusChanged(TransferStatusChanged {
            url: item.url.clone(),
            direction: item.direction,
            status: item.status,
            at: Utc::now().timestamp_millis(),
        }));
    }

    /// Write the snapshot while the caller still holds the item lock.
    async fn persist(&self, items: &[TransferItem]) -> TransferResult<()> {
        store::write_snapshot(&self.snapshot_path, items).await
    }

    async fn persist_or_log(&self, items: &[TransferItem], operation: &str) {
        if let Err(e) = self.persist(items).await {
            error!(
                "snapshot_write_failed: after {} path={} error={}",
                operation,
                self.snapshot_path.display(),
                e
            );
        }
    }

    /// Best-effort delete of an item's local file unless another entry still uses it.
    async fn delete_local_file(&self, remaining: &[TransferItem], item: &TransferItem) {
        if remaining
            .iter()
            .any(|other| other.local_file_spec == item.local_file_spec)
        {
            debug!(
                "delete_local_file: {} still referenced, keeping",
                item.local_file_spec
            );
            return;
        }
        let path = self.config.data_dir.join(&item.local_file_spec);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("delete_local_file: {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "delete_local_file_failed: {} error={}",
                path.display(),
                e
            ),
        }
    }

    /// Record a successful transfer against the live entry it was started
    /// for. An entry re-added for the same URL has a new id and stays pending.
    async fn complete(&self, finished: &TransferItem) -> bool {
        let mut items = self.items.lock().await;
        let live = items
            .iter()
            .position(|item| item.id == finished.id && item.is_pending());
        match live {
            Some(index) => {
                let item = &mut items[index];
                item.status = item.completed_status();
                info!("transfer_status: {} -> {}", item.url, item.status);
                self.emit_status(item);
                true
            }
            None => {
                warn!(
                    "transfer_orphaned: {} {} was removed while in flight",
                    finished.direction, finished.url
                );
                if finished.direction == Direction::Download {
                    self.delete_local_file(&items, finished).await;
                }
                false
            }
        }
    }

    /// One item task: wait for a worker slot, transfer, report back.
    async fn transfer_one(&self, item: TransferItem) -> bool {
        let _permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                debug!("transfer_skipped: {} limiter closed", item.url);
                return false;
            }
        };

        match worker::run_item(&self.client, &item, &self.config.data_dir, &self.cancel).await {
            Ok(()) => self.complete(&item).await,
            Err(TransferError::Cancelled) => {
                debug!("transfer_cancelled: {}", item.url);
                false
            }
            // Either way the item stays Required and is retried on the next pass.
            Err(e) if e.is_transient() => {
                warn!(
                    "transfer_failed: {} {} error={}",
                    item.direction, item.url, e
                );
                false
            }
            Err(e) => {
                error!(
                    "transfer_failed: {} {} permanent error={}",
                    item.direction, item.url, e
                );
                false
            }
        }
    }
}

/// Durable, priority-tagged upload/download queue.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct TransferQueue {
    inner: Arc<QueueInner>,
}

impl TransferQueue {
    pub fn new(
        config: TransferConfig,
        reachability: Arc<dyn Reachability>,
    ) -> TransferResult<Self> {
        let client = worker::build_client(&config)?;
        let snapshot_path = config.snapshot_path();
        let limiter = Arc::new(Semaphore::new(config.worker_slots()));
        let (pass_active, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(QueueInner {
                config,
                snapshot_path,
                items: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                ready: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                pass_active,
                client,
                limiter,
                reachability,
                cancel: CancellationToken::new(),
                events,
            }),
        })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.inner.snapshot_path
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn is_processing(&self) -> bool {
        *self.inner.pass_active.borrow()
    }

    /// Item tasks currently holding a worker slot
    pub fn active_transfers(&self) -> usize {
        self.inner
            .config
            .worker_slots()
            .saturating_sub(self.inner.limiter.available_permits())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    async fn items_guard(&self) -> MutexGuard<'_, Vec<TransferItem>> {
        self.inner.items.lock().await
    }

    /// Replace the in-memory list with the persisted snapshot and mark the
    /// queue ready. A missing snapshot means an empty queue; an unreadable one
    /// is moved aside, reported as an error, and also leaves the queue empty.
    pub async fn load(&self) -> TransferResult<usize> {
        let path = &self.inner.snapshot_path;
        let result = store::read_snapshot(path).await;

        let mut items = self.items_guard().await;
        let outcome = match result {
            Ok(Some(loaded)) => {
                *items = loaded;
                let reassigned = self.inner.reconcile_ids(&mut items);
                if reassigned > 0 {
                    debug!("queue_load: assigned ids to {} item(s)", reassigned);
                }
                Ok(items.len())
            }
            Ok(None) => {
                items.clear();
                info!("queue_load: no snapshot at {}", path.display());
                Ok(0)
            }
            Err(e) => {
                items.clear();
                error!("queue_load_failed: {} error={}", path.display(), e);
                if matches!(
                    e,
                    TransferError::Snapshot(_) | TransferError::SchemaVersion { .. }
                ) {
                    match store::set_aside_snapshot(path).await {
                        Ok(moved) => {
                            warn!("queue_load: kept rejected snapshot at {}", moved.display())
                        }
                        Err(move_err) => warn!(
                            "queue_load: could not move rejected snapshot error={}",
                            move_err
                        ),
                    }
                }
                Err(e)
            }
        };
        drop(items);

        if !self.inner.shut_down.load(Ordering::SeqCst) {
            self.inner.ready.store(true, Ordering::SeqCst);
        }
        if let Ok(count) = outcome {
            info!("queue_load: {} item(s) from {}", count, path.display());
        }
        outcome
    }

    /// Write the full list to the snapshot file.
    pub async fn save(&self) -> TransferResult<()> {
        let items = self.items_guard().await;
        self.inner.persist(&items).await
    }

    /// Queue a download of `url`. Returns `None` (and queues nothing) when no
    /// local path can be derived for the URL and kind.
    pub async fn add_download_request(
        &self,
        kind: TransferKind,
        url: &str,
        priority: TransferPriority,
    ) -> Option<TransferItem> {
        let local_file_spec = match paths::local_file_name(Direction::Download, kind, url) {
            Ok(name) => name,
            Err(e) => {
                warn!("add_download_skipped: {} error={}", url, e);
                return None;
            }
        };
        let mut item =
            TransferItem::new(Direction::Download, kind, url, local_file_spec, priority);
        self.inner.assign_id(&mut item);

        let mut items = self.items_guard().await;
        items.push(item.clone());
        self.inner.persist_or_log(&items, "add_download").await;
        drop(items);

        info!(
            "add_download: {} kind={} priority={} local={}",
            url, kind, priority, item.local_file_spec
        );
        self.inner.emit_status(&item);
        Some(item)
    }

    /// Stage `payload` on disk right away, then queue its upload to `url`.
    pub async fn add_upload_request(
        &self,
        kind: TransferKind,
        url: &str,
        payload: impl AsRef<[u8]>,
        priority: TransferPriority,
    ) -> Option<TransferItem> {
        let local_file_spec = match paths::local_file_name(Direction::Upload, kind, url) {
            Ok(name) => name,
            Err(e) => {
                warn!("add_upload_skipped: {} error={}", url, e);
                return None;
            }
        };

        let staged = self.inner.config.data_dir.join(&local_file_spec);
        if let Err(e) = tokio::fs::create_dir_all(&self.inner.config.data_dir).await {
            error!(
                "add_upload_failed: cannot create {} error={}",
                self.inner.config.data_dir.display(),
                e
            );
            return None;
        }
        if let Err(e) = tokio::fs::write(&staged, payload.as_ref()).await {
            error!(
                "add_upload_failed: cannot stage {} error={}",
                staged.display(),
                e
            );
            return None;
        }

        let mut item =
            TransferItem::new(Direction::Upload, kind, url, local_file_spec, priority);
        self.inner.assign_id(&mut item);
        let mut items = self.items_guard().await;
        items.push(item.clone());
        self.inner.persist_or_log(&items, "add_upload").await;
        drop(items);

        info!(
            "add_upload: {} kind={} priority={} bytes={}",
            url,
            kind,
            priority,
            payload.as_ref().len()
        );
        self.inner.emit_status(&item);
        Some(item)
    }

    /// Remove the entry for `item` and delete its local file. A queued item is
    /// matched by id; one built by the caller (id 0) matches the first entry
    /// with the same target. Returns false (and touches nothing) if no entry
    /// matches.
    pub async fn remove(&self, item: &TransferItem) -> bool {
        let mut items = self.items_guard().await;
        let found = items.iter().position(|current| {
            if item.id != 0 {
                current.id == item.id
            } else {
                current.same_target(item)
            }
        });
        let Some(index) = found else {
            debug!("remove: {} not queued", item.url);
            return false;
        };
        let removed = items.remove(index);
        self.inner.delete_local_file(&items, &removed).await;
        self.inner.persist_or_log(&items, "remove").await;
        drop(items);

        info!("remove: {} {}", removed.direction, removed.url);
        self.inner.emit(QueueEvent::ItemRemoved(TransferItemRemoved {
            url: removed.url,
            direction: removed.direction,
        }));
        true
    }

    /// Remove every entry and its local file. Returns the count removed.
    pub async fn remove_all(&self) -> usize {
        let mut items = self.items_guard().await;
        let removed: Vec<TransferItem> = items.drain(..).collect();
        for item in &removed {
            self.inner.delete_local_file(&items, item).await;
        }
        self.inner.persist_or_log(&items, "remove_all").await;
        drop(items);

        let count = removed.len();
        info!("remove_all: removed={}", count);
        self.inner
            .emit(QueueEvent::BatchOperation(TransferBatchOperation {
                operation: "remove_all".to_string(),
                count,
            }));
        count
    }

    /// First entry (in list order) whose URL matches
    pub async fn find(&self, url: &str) -> Option<TransferItem> {
        self.items_guard()
            .await
            .iter()
            .find(|item| item.url == url)
            .cloned()
    }

    pub async fn items(&self) -> Vec<TransferItem> {
        self.items_guard().await.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.items_guard()
            .await
            .iter()
            .filter(|item| item.is_pending())
            .count()
    }

    /// Absolute path of an item's local file
    pub fn local_path_of(&self, item: &TransferItem) -> PathBuf {
        self.inner.config.data_dir.join(&item.local_file_spec)
    }

    /// Run one processing pass over every `Required` item.
    ///
    /// Skipped when the queue is not ready, when another pass is active, or
    /// when the OS reports no network path. Per-item failures leave the item
    /// `Required` for a later pass; nothing is returned as an error.
    pub async fn process(&self) -> PassOutcome {
        if !self.is_ready() {
            debug!("process: queue not ready");
            return PassOutcome::NotReady;
        }
        let Some(_guard) = self.inner.begin_pass() else {
            debug!("process: pass already running, skipping");
            return PassOutcome::AlreadyRunning;
        };
        if !self.inner.reachability.is_online() {
            info!("process: offline, skipping pass");
            return PassOutcome::Offline;
        }

        let pending: Vec<TransferItem> = self
            .items_guard()
            .await
            .iter()
            .filter(|item| item.is_pending())
            .cloned()
            .collect();
        let attempted = pending.len();
        if attempted == 0 {
            debug!("process: nothing pending");
            return PassOutcome::Completed {
                attempted: 0,
                succeeded: 0,
            };
        }
        info!(
            "process_start: pending={} slots={}",
            attempted,
            self.inner.config.worker_slots()
        );

        let handles: Vec<JoinHandle<bool>> = pending
            .into_iter()
            .map(|item| {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { inner.transfer_one(item).await })
            })
            .collect();

        let mut succeeded = 0;
        for joined in join_all(handles).await {
            match joined {
                Ok(true) => succeeded += 1,
                Ok(false) => {}
                Err(e) => error!("process: transfer task aborted error={}", e),
            }
        }

        self.inner
            .persist_or_log(&self.items_guard().await, "process")
            .await;
        info!(
            "process_finish: attempted={} succeeded={}",
            attempted, succeeded
        );
        PassOutcome::Completed {
            attempted,
            succeeded,
        }
    }

    /// Start a pass in the background, e.g. right after an explicit enqueue.
    pub fn spawn_process(&self) -> JoinHandle<PassOutcome> {
        let queue = self.clone();
        tokio::spawn(async move { queue.process().await })
    }

    /// Stop accepting passes, wait up to `timeout` for the active one, then
    /// cancel in-flight transfers and close the worker limiter. Idempotent.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.ready.store(false, Ordering::SeqCst);

        let mut pass_active = self.inner.pass_active.subscribe();
        let finished = tokio::time::timeout(timeout, pass_active.wait_for(|active| !*active))
            .await
            .is_ok();
        if !finished {
            warn!(
                "queue_shutdown: pass still running after {}ms, cancelling in-flight transfers",
                timeout.as_millis()
            );
        }

        self.inner.cancel.cancel();
        self.inner.limiter.close();
        info!("queue_shutdown: done");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for TransferQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferQueue")
            .field("snapshot_path", &self.inner.snapshot_path)
            .field("ready", &self.is_ready())
            .field("processing", &self.is_processing())
            .finish()
    }
}
