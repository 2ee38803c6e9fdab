//! Connectivity watcher - polls reachability and drives single-flight reactions

use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::reachability::Reachability;

/// Default poll interval (10 seconds)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;

/// Default wait for in-flight reactions on dispose
pub const DEFAULT_DISPOSE_GRACE_MS: u64 = 500;

/// Result returned by a registered reaction
pub type ActionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type ActionFn = dyn Fn(bool) -> BoxFuture<'static, ActionResult> + Send + Sync;

/// Registry bucket. Every bucket is polled on every tick; the key is organizational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ActionPriority {
    Critical,
    Normal,
    Low,
}

impl std::fmt::Display for ActionPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionPriority::Critical => write!(f, "critical"),
            ActionPriority::Normal => write!(f, "normal"),
            ActionPriority::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_ms: u64,
    pub dispose_grace_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            dispose_grace_ms: DEFAULT_DISPOSE_GRACE_MS,
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        // interval() panics on a zero period
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn dispose_grace(&self) -> Duration {
        Duration::from_millis(self.dispose_grace_ms)
    }
}

/// One connectivity-reactive callback with its in-flight flag
pub struct RegisteredAction {
    name: String,
    priority: ActionPriority,
    callback: Box<ActionFn>,
    running: AtomicBool,
}

impl RegisteredAction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> ActionPriority {
        self.priority
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn try_claim(self: &Arc<Self>) -> Option<RunningGuard> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunningGuard {
                action: Arc::clone(self),
            })
    }
}

impl std::fmt::Debug for RegisteredAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredAction")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Clears the running flag when the invocation ends, including by panic.
struct RunningGuard {
    action: Arc<RegisteredAction>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.action.running.store(false, Ordering::SeqCst);
    }
}

struct WatcherInner {
    config: WatcherConfig,
    reachability: Arc<dyn Reachability>,
    registry: Mutex<BTreeMap<ActionPriority, Vec<Arc<RegisteredAction>>>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    poke: Notify,
    status: watch::Sender<bool>,
    disposed: AtomicBool,
}

impl WatcherInner {
    fn registry(&self) -> MutexGuard<'_, BTreeMap<ActionPriority, Vec<Arc<RegisteredAction>>>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_status(&self, online: bool) {
        let changed = self.status.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            if online {
                info!("connectivity: online");
            } else {
                warn!("connectivity: offline");
            }
        }
    }

    fn tick(&self) -> usize {
        if self.disposed.load(Ordering::SeqCst) {
            return 0;
        }

        let online = self.reachability.is_online();
        self.record_status(online);

        let actions: Vec<Arc<RegisteredAction>> =
            self.registry().values().flatten().cloned().collect();

        let mut launched = 0;
        for action in actions {
            let Some(guard) = action.try_claim() else {
                debug!("watch_tick: skip busy action {}", action.name);
                continue;
            };
            self.tracker.spawn(async move {
                let action = Arc::clone(&guard.action);
                let result = (action.callback)(online).await;
                if let Err(e) = result {
                    warn!(
                        "watch_action_failed: {} priority={} error={}",
                        action.name, action.priority, e
                    );
                }
                drop(guard);
            });
            launched += 1;
        }
        launched
    }
}

async fn run_timer(inner: Arc<WatcherInner>) {
    let mut ticker = tokio::time::interval(inner.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = inner.poke.notified() => {
                debug!("watch_tick: poked");
            }
        }
        inner.tick();
    }
    debug!("watch_timer: stopped");
}

/// Polls reachability on a fixed interval and runs each registered action at
/// most once concurrently, passing the sampled connectivity.
pub struct ConnectivityWatcher {
    inner: Arc<WatcherInner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityWatcher {
    /// Create a watcher without a timer; reactions only run on explicit `tick()`.
    pub fn new(config: WatcherConfig, reachability: Arc<dyn Reachability>) -> Self {
        let (status, _) = watch::channel(false);
        Self {
            inner: Arc::new(WatcherInner {
                config,
                reachability,
                registry: Mutex::new(BTreeMap::new()),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
                poke: Notify::new(),
                status,
                disposed: AtomicBool::new(false),
            }),
            timer: Mutex::new(None),
        }
    }

    /// Create a watcher and spawn its timer on the current tokio runtime.
    /// The first tick fires immediately.
    pub fn start(config: WatcherConfig, reachability: Arc<dyn Reachability>) -> Self {
        let watcher = Self::new(config, reachability);
        let handle = tokio::spawn(run_timer(Arc::clone(&watcher.inner)));
        *watcher.timer.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!(
            "watcher_started: interval_ms={}",
            watcher.inner.config.poll_interval().as_millis()
        );
        watcher
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.inner.config
    }

    /// Register a reaction. Safe to call while ticks are running.
    pub fn register_action<F, Fut>(&self, name: &str, priority: ActionPriority, callback: F)
    where
        F: Fn(bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        let action = Arc::new(RegisteredAction {
            name: name.to_string(),
            priority,
            callback: Box::new(move |online| Box::pin(callback(online))),
            running: AtomicBool::new(false),
        });
        self.inner
            .registry()
            .entry(priority)
            .or_default()
            .push(action);
        info!("watch_register: {} priority={}", name, priority);
    }

    pub fn action_count(&self) -> usize {
        self.inner.registry().values().map(Vec::len).sum()
    }

    /// Registered actions in bucket order
    pub fn actions(&self) -> Vec<Arc<RegisteredAction>> {
        self.inner.registry().values().flatten().cloned().collect()
    }

    /// Synchronous, best-effort reachability check. Never fails.
    pub fn is_online(&self) -> bool {
        self.inner.reachability.is_online()
    }

    /// Connectivity as of the last tick
    pub fn last_status(&self) -> bool {
        *self.inner.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.status.subscribe()
    }

    /// Sample connectivity once and launch every idle action.
    /// Returns the number of actions launched.
    pub fn tick(&self) -> usize {
        self.inner.tick()
    }

    /// Request an out-of-schedule tick, e.g. from an OS connectivity-change hook.
    pub fn poke(&self) {
        self.inner.poke.notify_one();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Stop the timer and wait up to the grace period for in-flight actions.
    /// Repeated calls are no-ops.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();

        let timer = self
            .timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = timer {
            let _ = handle.await;
        }

        self.inner.tracker.close();
        let grace = self.inner.config.dispose_grace();
        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "watcher_dispose: {} action(s) still running after {}ms",
                self.inner.tracker.len(),
                grace.as_millis()
            );
        }
        info!("watcher_disposed");
    }
}

impl Drop for ConnectivityWatcher {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn offline_watcher() -> ConnectivityWatcher {
        ConnectivityWatcher::new(WatcherConfig::default(), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn watcher_config_defaults_to_ten_second_poll() {
        let config = WatcherConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.dispose_grace(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn busy_action_is_skipped_until_it_returns() {
        let watcher = offline_watcher();
        let gate = Arc::new(Notify::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let action_gate = Arc::clone(&gate);
        watcher.register_action("slow", ActionPriority::Normal, move |online| {
            let gate = Arc::clone(&action_gate);
            let tx = tx.clone();
            async move {
                let _ = tx.send(online);
                gate.notified().await;
                Ok(())
            }
        });

        assert_eq!(watcher.tick(), 1);
        assert_eq!(rx.recv().await, Some(false));
        assert_eq!(watcher.tick(), 0);
        assert!(watcher.actions()[0].is_running());

        gate.notify_one();
        while watcher.actions()[0].is_running() {
            tokio::task::yield_now().await;
        }
        assert_eq!(watcher.tick(), 1);
        assert_eq!(rx.recv().await, Some(false));
        gate.notify_one();
    }

    #[tokio::test]
    async fn failing_action_does_not_block_others() {
        let watcher = offline_watcher();
        let failures = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let failure_count = Arc::clone(&failures);
        watcher.register_action("broken", ActionPriority::Critical, move |_| {
            let failures = Arc::clone(&failure_count);
            async move {
                failures.fetch_add(1, Ordering::SeqCst);
                Err("boom".into())
            }
        });
        watcher.register_action("healthy", ActionPriority::Low, move |_| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
                Ok(())
            }
        });

        for _ in 0..2 {
            assert_eq!(watcher.tick(), 2);
            rx.recv().await;
            while watcher.actions().iter().any(|a| a.is_running()) {
                tokio::task::yield_now().await;
            }
        }
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_action_releases_its_flag() {
        let watcher = offline_watcher();
        watcher.register_action("panics", ActionPriority::Normal, |_| async {
            if std::hint::black_box(true) {
                panic!("reaction panicked");
            }
            Ok(())
        });

        assert_eq!(watcher.tick(), 1);
        while watcher.actions()[0].is_running() {
            tokio::task::yield_now().await;
        }
        assert_eq!(watcher.tick(), 1);
    }

    #[tokio::test]
    async fn registry_groups_actions_by_priority() {
        let watcher = offline_watcher();
        watcher.register_action("low", ActionPriority::Low, |_| async { Ok(()) });
        watcher.register_action("critical", ActionPriority::Critical, |_| async { Ok(()) });
        watcher.register_action("normal", ActionPriority::Normal, |_| async { Ok(()) });

        let names: Vec<String> = watcher
            .actions()
            .iter()
            .map(|a| a.name().to_string())
            .collect();
        assert_eq!(names, vec!["critical", "normal", "low"]);
        assert_eq!(watcher.action_count(), 3);
    }

    #[tokio::test]
    async fn tick_publishes_connectivity_transitions() {
        let flag = Arc::new(AtomicBool::new(false));
        let watcher = ConnectivityWatcher::new(WatcherConfig::default(), flag.clone());
        let mut status = watcher.subscribe();

        watcher.tick();
        assert!(!watcher.last_status());

        flag.store(true, Ordering::SeqCst);
        watcher.tick();
        status.changed().await.unwrap();
        assert!(*status.borrow());
        assert!(watcher.last_status());
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_stops_ticks() {
        let watcher = offline_watcher();
        watcher.dispose().await;
        watcher.dispose().await;
        assert!(watcher.is_disposed());

        watcher.register_action("late", ActionPriority::Normal, |_| async { Ok(()) });
        assert_eq!(watcher.tick(), 0);
    }

    fn counting_action(
        watcher: &ConnectivityWatcher,
        hold: Duration,
    ) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let (calls_in, peak_in) = (Arc::clone(&calls), Arc::clone(&peak));
        watcher.register_action("counter", ActionPriority::Normal, move |_| {
            let calls = Arc::clone(&calls_in);
            let peak = Arc::clone(&peak_in);
            let active = Arc::clone(&active);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(hold).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });
        (calls, peak)
    }

    #[tokio::test(start_paused = true)]
    async fn slow_action_is_not_reinvoked_by_overlapping_ticks() {
        let watcher =
            ConnectivityWatcher::start(WatcherConfig::default(), Arc::new(AtomicBool::new(true)));
        let (calls, peak) = counting_action(&watcher, Duration::from_secs(25));

        // ticks at 0s, 10s, 20s, 30s; the first run holds until 25s
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        watcher.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn poke_runs_an_early_tick() {
        let watcher =
            ConnectivityWatcher::start(WatcherConfig::default(), Arc::new(AtomicBool::new(true)));
        let (calls, _) = counting_action(&watcher, Duration::from_millis(10));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        watcher.poke();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        watcher.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_stops_the_timer() {
        let watcher =
            ConnectivityWatcher::start(WatcherConfig::default(), Arc::new(AtomicBool::new(true)));
        let (calls, _) = counting_action(&watcher, Duration::from_millis(10));

        tokio::time::sleep(Duration::from_secs(1)).await;
        watcher.dispose().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
