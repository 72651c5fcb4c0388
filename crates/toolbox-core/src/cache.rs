//! Keyed cache of long-lived backend services.
//!
//! Holds exactly one live [`Service`] per key. Creation is single-flight:
//! concurrent callers for a missing key share one factory call and its
//! result (or its error). A reaper evicts services idle for longer than
//! their own idle timeout; eviction removes the entry under the cache lock
//! and tears it down after the lock is released.

use crate::error::{ToolboxError, ToolboxResult};
use crate::fingerprint::short_key;
use crate::service::{AsAnyArc, BackendKind, Service};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type CreateFuture = Pin<Box<dyn Future<Output = ToolboxResult<Arc<dyn Service>>> + Send>>;
type Outcome = Option<ToolboxResult<Arc<ServiceHandle>>>;

/// One cached service plus its bookkeeping.
pub struct ServiceHandle {
    key: String,
    service: Arc<dyn Service>,
    created_at: Instant,
    last_used: std::sync::Mutex<Instant>,
    stopped: AtomicBool,
}

impl ServiceHandle {
    fn new(key: String, service: Arc<dyn Service>) -> Self {
        let now = Instant::now();
        Self {
            key,
            service,
            created_at: now,
            last_used: std::sync::Mutex::new(now),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> BackendKind {
        self.service.kind()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.service.idle_timeout()
    }

    /// Later of the cache's own bookkeeping and the service's self-report.
    pub fn last_used(&self) -> Instant {
        let own = *self.last_used.lock().unwrap_or_else(|e| e.into_inner());
        match self.service.last_used().map(Instant::from_std) {
            Some(reported) if reported > own => reported,
            _ => own,
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used())
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.idle_for(now) > self.idle_timeout()
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Stop the service; only the first call reaches [`Service::stop`].
    async fn teardown(&self) -> ToolboxResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.service.stop().await
    }

    fn downcast<T: Service>(&self) -> ToolboxResult<Arc<T>> {
        <dyn Service as AsAnyArc>::into_any(self.service.clone())
            .downcast::<T>()
            .map_err(|_| ToolboxError::ServiceType {
                key: self.key.clone(),
                expected: std::any::type_name::<T>(),
            })
    }
}

enum Slot {
    Ready(Arc<ServiceHandle>),
    Creating { id: u64, done: watch::Receiver<Outcome> },
}

/// Diagnostic view of one cached service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub key: String,
    pub kind: BackendKind,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Shared cache of backend services, keyed by connection fingerprint.
pub struct ResourceCache {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    next_id: AtomicU64,
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceCache {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Return the service cached under `key`, creating it with `factory` if
    /// it is missing.
    ///
    /// `factory` runs at most once per key no matter how many callers race
    /// here; they all receive the same instance or the same error. Failures
    /// are never cached.
    pub async fn get_or_create<T, F, Fut>(&self, key: &str, factory: F) -> ToolboxResult<Arc<T>>
    where
        T: Service,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ToolboxResult<T>> + Send + 'static,
    {
        let create: CreateFuture = Box::pin(async move {
            let service = factory().await?;
            Ok(Arc::new(service) as Arc<dyn Service>)
        });
        let handle = self.handle_for(key, create).await?;
        handle.downcast::<T>()
    }

    async fn handle_for(&self, key: &str, create: CreateFuture) -> ToolboxResult<Arc<ServiceHandle>> {
        let mut done = {
            let mut slots = self.slots.lock().await;
            match slots.get(key) {
                Some(Slot::Ready(handle)) => {
                    handle.touch();
                    return Ok(handle.clone());
                }
                Some(Slot::Creating { done, .. }) => done.clone(),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    slots.insert(
                        key.to_string(),
                        Slot::Creating {
                            id,
                            done: rx.clone(),
                        },
                    );
                    self.spawn_creation(key.to_string(), id, create, tx);
                    rx
                }
            }
        };

        let outcome = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ToolboxError::Backend(format!("creation of {key} was aborted")))?;
        match &*outcome {
            Some(result) => result.clone(),
            None => Err(ToolboxError::Backend(format!("creation of {key} produced no result"))),
        }
    }

    /// Run the factory in its own task so a cancelled caller cannot strand
    /// the other waiters.
    fn spawn_creation(&self, key: String, id: u64, create: CreateFuture, tx: watch::Sender<Outcome>) {
        let slots = self.slots.clone();
        tokio::spawn(async move {
            let result = match tokio::spawn(create).await {
                Ok(result) => result,
                Err(e) => Err(ToolboxError::from(e)),
            };

            let mut guard = slots.lock().await;
            let still_current =
                matches!(guard.get(&key), Some(Slot::Creating { id: slot_id, .. }) if *slot_id == id);

            let outcome = match result {
                Ok(service) => {
                    let handle = Arc::new(ServiceHandle::new(key.clone(), service));
                    if still_current {
                        guard.insert(key.clone(), Slot::Ready(handle.clone()));
                        drop(guard);
                        info!(key = %short_key(&key), kind = %handle.kind(), "service created");
                        Ok(handle)
                    } else {
                        drop(guard);
                        warn!(key = %short_key(&key), "service invalidated during creation, discarding");
                        if let Err(e) = handle.teardown().await {
                            warn!(key = %short_key(&key), error = %e, "teardown of discarded service failed");
                        }
                        Err(ToolboxError::Invalidated(key.clone()))
                    }
                }
                Err(e) => {
                    if still_current {
                        guard.remove(&key);
                    }
                    drop(guard);
                    warn!(key = %short_key(&key), error = %e, "service creation failed");
                    Err(e)
                }
            };

            let _ = tx.send(Some(outcome));
        });
    }

    /// Remove `key` and tear its service down now.
    ///
    /// Returns whether anything was cached under the key. A creation still in
    /// flight is detached: its result is torn down instead of being cached.
    pub async fn invalidate(&self, key: &str) -> ToolboxResult<bool> {
        let removed = self.slots.lock().await.remove(key);
        match removed {
            Some(Slot::Ready(handle)) => {
                info!(key = %short_key(key), "service invalidated");
                handle.teardown().await?;
                Ok(true)
            }
            Some(Slot::Creating { .. }) => {
                debug!(key = %short_key(key), "pending creation detached");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Evict every service idle past its timeout.
    ///
    /// Expired entries are collected and removed under the lock; teardown
    /// happens afterwards so slow disconnects never stall other keys.
    /// Returns the evicted keys.
    pub async fn reap(&self) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<Arc<ServiceHandle>> = {
            let mut slots = self.slots.lock().await;
            let keys: Vec<String> = slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(handle) if handle.is_expired(now) => Some(key.clone()),
                    _ => None,
                })
                .collect();
            keys.iter()
                .filter_map(|key| match slots.remove(key) {
                    Some(Slot::Ready(handle)) => Some(handle),
                    _ => None,
                })
                .collect()
        };

        for handle in &expired {
            let idle_secs = handle.idle_for(now).as_secs();
            match handle.teardown().await {
                Ok(()) => info!(key = %short_key(handle.key()), idle_secs, "idle service evicted"),
                Err(e) => warn!(key = %short_key(handle.key()), error = %e, "teardown of idle service failed"),
            }
        }

        expired.iter().map(|h| h.key.clone()).collect()
    }

    /// Sweep the cache every `interval` until the cache is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let evicted = cache.reap().await;
                if !evicted.is_empty() {
                    debug!(count = evicted.len(), "reaper evicted idle services");
                }
            }
        })
    }

    /// Tear down every cached service.
    pub async fn shutdown(&self) {
        let drained: Vec<Slot> = {
            let mut slots = self.slots.lock().await;
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in drained {
            if let Slot::Ready(handle) = slot {
                if let Err(e) = handle.teardown().await {
                    warn!(key = %short_key(handle.key()), error = %e, "teardown on shutdown failed");
                }
            }
        }
    }

    /// List every ready service.
    pub async fn snapshot(&self) -> Vec<ServiceInfo> {
        let now = Instant::now();
        let slots = self.slots.lock().await;
        slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(h) => Some(ServiceInfo {
                    key: h.key.clone(),
                    kind: h.kind(),
                    age_secs: now.saturating_duration_since(h.created_at).as_secs(),
                    idle_secs: h.idle_for(now).as_secs(),
                    idle_timeout_secs: h.idle_timeout().as_secs(),
                }),
                Slot::Creating { .. } => None,
            })
            .collect()
    }

    /// Number of ready services.
    pub async fn len(&self) -> usize {
        let slots = self.slots.lock().await;
        slots.values().filter(|s| matches!(s, Slot::Ready(_))).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct CountingService {
        idle: Duration,
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Service for CountingService {
        fn kind(&self) -> BackendKind {
            BackendKind::Redis
        }

        fn idle_timeout(&self) -> Duration {
            self.idle
        }

        async fn stop(&self) -> ToolboxResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct OtherService;

    #[async_trait]
    impl Service for OtherService {
        fn kind(&self) -> BackendKind {
            BackendKind::Sql
        }

        fn idle_timeout(&self) -> Duration {
            Duration::from_secs(60)
        }

        async fn stop(&self) -> ToolboxResult<()> {
            Ok(())
        }
    }

    fn counting(idle: Duration, stops: &Arc<AtomicUsize>) -> CountingService {
        CountingService {
            idle,
            stops: stops.clone(),
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_creation() {
        let cache = Arc::new(ResourceCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            let stops = stops.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_create("redis-a", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(counting(Duration::from_secs(60), &stops))
                    })
                    .await
            }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn creation_error_is_shared_and_not_cached() {
        let cache = Arc::new(ResourceCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_create::<CountingService, _, _>("redis-down", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(ToolboxError::Backend("connection refused".into()))
                    })
                    .await
            }));
        }

        for task in tasks {
            let err = task.await.unwrap().err().unwrap();
            assert_eq!(err.to_string(), "backend error: connection refused");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty().await);

        let stops = Arc::new(AtomicUsize::new(0));
        let retried = cache
            .get_or_create("redis-down", move || async move {
                Ok(counting(Duration::from_secs(60), &stops))
            })
            .await;
        assert!(retried.is_ok());
    }

    #[tokio::test]
    async fn idle_service_is_reaped_exactly_once() {
        let cache = ResourceCache::new();
        let stops = Arc::new(AtomicUsize::new(0));
        let s = stops.clone();
        cache
            .get_or_create("redis-idle", move || async move {
                Ok(counting(Duration::from_millis(10), &s))
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.reap().await, vec!["redis-idle".to_string()]);
        assert!(cache.reap().await.is_empty());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn recently_used_service_survives_reap() {
        let cache = ResourceCache::new();
        let stops = Arc::new(AtomicUsize::new(0));
        let s = stops.clone();
        cache
            .get_or_create("redis-busy", move || async move {
                Ok(counting(Duration::from_secs(5), &s))
            })
            .await
            .unwrap();

        assert!(cache.reap().await.is_empty());
        assert_eq!(cache.len().await, 1);
        assert_eq!(stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalidate_mid_use_yields_fresh_handle() {
        let cache = ResourceCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));

        let make = |calls: Arc<AtomicUsize>, stops: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(counting(Duration::from_secs(60), &stops))
            }
        };

        let held = cache
            .get_or_create("redis-creds", make(calls.clone(), stops.clone()))
            .await
            .unwrap();
        assert!(cache.invalidate("redis-creds").await.unwrap());
        assert!(!cache.invalidate("redis-creds").await.unwrap());

        let fresh = cache
            .get_or_create("redis-creds", make(calls.clone(), stops.clone()))
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&held, &fresh));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mismatched_type_is_reported() {
        let cache = ResourceCache::new();
        let stops = Arc::new(AtomicUsize::new(0));
        cache
            .get_or_create("shared-key", move || async move {
                Ok(counting(Duration::from_secs(60), &stops))
            })
            .await
            .unwrap();

        let err = cache
            .get_or_create("shared-key", || async { Ok(OtherService) })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ToolboxError::ServiceType { .. }));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn invalidate_during_creation_discards_result() {
        let cache = Arc::new(ResourceCache::new());
        let stops = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let pending = {
            let cache = cache.clone();
            let stops = stops.clone();
            let release = release.clone();
            tokio::spawn(async move {
                cache
                    .get_or_create("redis-slow", move || async move {
                        release.notified().await;
                        Ok(counting(Duration::from_secs(60), &stops))
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.invalidate("redis-slow").await.unwrap());
        release.notify_one();

        let err = pending.await.unwrap().err().unwrap();
        assert!(matches!(err, ToolboxError::Invalidated(_)));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn background_reaper_evicts_idle_service_once() {
        let cache = Arc::new(ResourceCache::new());
        let stops = Arc::new(AtomicUsize::new(0));
        let s = stops.clone();
        cache
            .get_or_create("redis-bg", move || async move {
                Ok(counting(Duration::from_secs(30), &s))
            })
            .await
            .unwrap();
        let reaper = cache.spawn_reaper(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(cache.len().await, 1);
        assert_eq!(stops.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(cache.is_empty().await);
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        reaper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_exits_once_cache_is_dropped() {
        let cache = Arc::new(ResourceCache::new());
        let reaper = cache.spawn_reaper(Duration::from_secs(1));
        drop(cache);
        let finished = tokio::time::timeout(Duration::from_secs(5), reaper).await;
        assert!(matches!(finished, Ok(Ok(()))));
    }

    struct TrackedService {
        stopped: AtomicBool,
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Service for TrackedService {
        fn kind(&self) -> BackendKind {
            BackendKind::Redis
        }

        fn idle_timeout(&self) -> Duration {
            Duration::from_millis(20)
        }

        async fn stop(&self) -> ToolboxResult<()> {
            self.stopped.store(true, Ordering::SeqCst);
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lookups_racing_the_reaper_never_see_stopped_services() {
        let cache = Arc::new(ResourceCache::new());
        let creations = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let stale = Arc::new(AtomicUsize::new(0));
        let reaper = cache.spawn_reaper(Duration::from_millis(1));

        let mut workers = Vec::new();
        for worker in 0..4u64 {
            let cache = cache.clone();
            let creations = creations.clone();
            let stops = stops.clone();
            let stale = stale.clone();
            workers.push(tokio::spawn(async move {
                for i in 0..60u64 {
                    let creations = creations.clone();
                    let stops = stops.clone();
                    let service = cache
                        .get_or_create("redis-race", move || async move {
                            creations.fetch_add(1, Ordering::SeqCst);
                            Ok(TrackedService {
                                stopped: AtomicBool::new(false),
                                stops,
                            })
                        })
                        .await
                        .unwrap();
                    if service.stopped.load(Ordering::SeqCst) {
                        stale.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis((i * 7 + worker * 3) % 30)).await;
                }
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        reaper.abort();
        cache.shutdown().await;
        assert_eq!(stale.load(Ordering::SeqCst), 0);
        assert!(creations.load(Ordering::SeqCst) > 1, "reaper never evicted");
        assert_eq!(creations.load(Ordering::SeqCst), stops.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_tears_everything_down() {
        let cache = ResourceCache::new();
        let stops = Arc::new(AtomicUsize::new(0));
        for key in ["redis-1", "redis-2"] {
            let s = stops.clone();
            cache
                .get_or_create(key, move || async move {
                    Ok(counting(Duration::from_secs(60), &s))
                })
                .await
                .unwrap();
        }

        assert_eq!(cache.snapshot().await.len(), 2);
        cache.shutdown().await;
        assert!(cache.is_empty().await);
        assert_eq!(stops.load(Ordering::SeqCst), 2);
    }
}
