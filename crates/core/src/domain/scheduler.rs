//! Scheduling primitives: cancellable periodic tasks, observer gating,
//! re-entry protection, keyed debouncing and keyed serialization.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Counts active observers. Gated loops skip their work while nobody watches.
#[derive(Debug, Clone, Default)]
pub struct ObserverGate {
    observers: Arc<AtomicUsize>,
}

/// Keeps the gate open until dropped
#[derive(Debug)]
pub struct ObserverGuard {
    observers: Arc<AtomicUsize>,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.observers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ObserverGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self) -> ObserverGuard {
        self.observers.fetch_add(1, Ordering::SeqCst);
        ObserverGuard {
            observers: self.observers.clone(),
        }
    }

    pub fn is_observed(&self) -> bool {
        self.observers.load(Ordering::SeqCst) > 0
    }
}

/// Rejects a pass while the previous one is still running
#[derive(Debug, Default)]
pub struct ReentryGuard {
    busy: AtomicBool,
}

/// Marks a pass in progress; releases on drop
#[derive(Debug)]
pub struct ReentryToken<'a> {
    busy: &'a AtomicBool,
}

impl Drop for ReentryToken<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl ReentryGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_enter(&self) -> Option<ReentryToken<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ReentryToken { busy: &self.busy })
    }
}

/// Per-key minimum spacing between firings
#[derive(Debug)]
pub struct Debouncer<K> {
    window: Duration,
    last: Mutex<HashMap<K, Instant>>,
}

impl<K: Eq + Hash + Clone> Debouncer<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Fire `key` if its window has elapsed; records the firing
    pub fn try_fire(&self, key: &K) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match last.get(key) {
            Some(at) if now.saturating_duration_since(*at) < self.window => false,
            _ => {
                last.insert(key.clone(), now);
                true
            }
        }
    }

    pub fn mark(&self, key: &K) {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), Instant::now());
    }

    pub fn reset(&self, key: &K) {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// Serializes async operations that share a key; distinct keys run concurrently
#[derive(Debug, Default)]
pub struct KeyedSerializer {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Handle to a scheduled task
#[derive(Debug, Clone)]
pub struct PeriodicTask {
    token: CancellationToken,
}

impl PeriodicTask {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Owns every background task of the daemon
#[derive(Debug, Default)]
pub struct Scheduler {
    root: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` every `every`. With a gate the tick is skipped while nobody
    /// observes. A tick never overlaps the previous one.
    pub fn spawn_periodic<F, Fut>(
        &self,
        name: &'static str,
        every: Duration,
        gate: Option<ObserverGate>,
        f: F,
    ) -> PeriodicTask
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.child_token();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(task = name, ?every, "Periodic task started");

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        debug!(task = name, "Periodic task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if gate.as_ref().map(|g| g.is_observed()).unwrap_or(true) {
                            f().await;
                        }
                    }
                }
            }
        });
        self.track(handle);
        PeriodicTask { token }
    }

    /// Run `fut` once after `delay` unless cancelled first
    pub fn spawn_after<Fut>(&self, name: &'static str, delay: Duration, fut: Fut) -> PeriodicTask
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.child_token();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => debug!(task = name, "Delayed task cancelled"),
                _ = tokio::time::sleep(delay) => fut.await,
            }
        });
        self.track(handle);
        PeriodicTask { token }
    }

    /// Run `fut` until it completes or the scheduler shuts down
    pub fn spawn<Fut>(&self, name: &'static str, fut: Fut) -> PeriodicTask
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.child_token();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => debug!(task = name, "Task stopped"),
                _ = fut => {}
            }
        });
        self.track(handle);
        PeriodicTask { token }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Cancel every task and wait for them to finish
    pub async fn shutdown(&self) {
        info!("Stopping scheduled tasks");
        self.root.cancel();
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn test_debouncer_window() {
        let debouncer = Debouncer::new(Duration::from_millis(1500));
        assert!(debouncer.try_fire(&"firefox"));
        assert!(!debouncer.try_fire(&"firefox"));
        // Other keys are independent
        assert!(debouncer.try_fire(&"discord"));

        tokio::time::advance(Duration::from_millis(1499)).await;
        assert!(!debouncer.try_fire(&"firefox"));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(debouncer.try_fire(&"firefox"));

        debouncer.reset(&"firefox");
        assert!(debouncer.try_fire(&"firefox"));
    }

    #[test]
    fn test_reentry_guard() {
        let guard = ReentryGuard::new();
        let token = guard.try_enter();
        assert!(token.is_some());
        assert!(guard.try_enter().is_none());
        drop(token);
        assert!(guard.try_enter().is_some());
    }

    #[test]
    fn test_observer_gate() {
        let gate = ObserverGate::new();
        assert!(!gate.is_observed());
        let a = gate.observe();
        let b = gate.clone().observe();
        assert!(gate.is_observed());
        drop(a);
        assert!(gate.is_observed());
        drop(b);
        assert!(!gate.is_observed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_respects_gate_and_cancel() {
        let scheduler = Scheduler::new();
        let gate = ObserverGate::new();
        let runs = Arc::new(AtomicU32::new(0));

        let counter = runs.clone();
        let task = scheduler.spawn_periodic(
            "count",
            Duration::from_millis(200),
            Some(gate.clone()),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let guard = gate.observe();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let observed = runs.load(Ordering::SeqCst);
        assert!(observed >= 4, "ran {} times", observed);
        drop(guard);

        task.cancel();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(runs.load(Ordering::SeqCst) <= observed + 1);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_after_can_be_cancelled() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        let task = scheduler.spawn_after("late", Duration::from_secs(2), async move {
            flag.store(true, Ordering::SeqCst);
        });
        task.cancel();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!fired.load(Ordering::SeqCst));

        let flag = fired.clone();
        scheduler.spawn_after("on-time", Duration::from_secs(2), async move {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_keyed_serializer_distinct_keys() {
        let serializer = KeyedSerializer::new();
        let a = serializer.lock("channel-links").await;
        // A different key is not blocked
        let _b = serializer.lock("stream-links").await;
        drop(a);
        let _c = serializer.lock("channel-links").await;
    }
}
