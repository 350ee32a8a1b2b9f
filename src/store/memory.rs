use crate::clock::{Clock, SystemClock};
use crate::store::{StoreError, WindowSnapshot, WindowStore};
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 10;

/// A [WindowStore] that keeps windows in a [DashMap](dashmap::DashMap).
///
/// Each check holds the key's map entry for its whole duration, which makes it atomic within this
/// process only. Replicas do not share an in-memory store, so use this for tests and single
/// instance deployments.
#[derive(Clone)]
pub struct InMemoryWindowStore {
    map: Arc<DashMap<String, Window>>,
    // Only held so the collector is aborted once the last clone is dropped.
    _gc_handle: Option<Arc<GcHandle>>,
}

#[derive(Default)]
struct Window {
    /// Timestamp to number of events recorded at that timestamp.
    events: BTreeMap<u64, u64>,
    len: u64,
    /// Equivalent of the key's TTL: once reached the window is empty.
    expires_at: u64,
}

impl Window {
    fn prune(&mut self, boundary: u64) {
        // Keep only events strictly after the boundary.
        self.events = self.events.split_off(&boundary.saturating_add(1));
        self.len = self.events.values().sum();
    }

    fn clear(&mut self) {
        self.events.clear();
        self.len = 0;
    }

    fn record(&mut self, now: u64) {
        *self.events.entry(now).or_default() += 1;
        self.len += 1;
    }

    fn oldest(&self) -> Option<u64> {
        self.events.keys().next().copied()
    }
}

struct GcHandle(JoinHandle<()>);

impl Drop for GcHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl InMemoryWindowStore {
    pub fn builder() -> InMemoryWindowStoreBuilder {
        InMemoryWindowStoreBuilder {
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
            clock: Arc::new(SystemClock),
        }
    }

    fn garbage_collector(
        map: Arc<DashMap<String, Window>>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> JoinHandle<()> {
        assert!(
            interval.as_secs_f64() > 0f64,
            "GC interval must be non-zero"
        );
        actix_web::rt::spawn(async move {
            loop {
                let next = Instant::now() + interval;
                let now = clock.now_millis();
                map.retain(|_k, w| w.expires_at > now);
                actix_web::rt::time::sleep_until(next).await;
            }
        })
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn execute(
        &self,
        key: &str,
        limit: u64,
        window_millis: u64,
        now_millis: u64,
    ) -> Result<WindowSnapshot, StoreError> {
        // The entry guard locks the shard until the end of this block.
        let mut window = self.map.entry(key.to_owned()).or_default();
        if window.expires_at <= now_millis {
            window.clear();
        }
        if let Some(boundary) = now_millis.checked_sub(window_millis) {
            window.prune(boundary);
        }
        let admitted = window.len < limit;
        if admitted {
            window.record(now_millis);
            window.expires_at = window
                .expires_at
                .max(now_millis.saturating_add(window_millis));
        }
        Ok(WindowSnapshot {
            admitted,
            count: window.len,
            oldest_millis: window.oldest(),
        })
    }
}

pub struct InMemoryWindowStoreBuilder {
    gc_interval: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl InMemoryWindowStoreBuilder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection. The collector is spawned on the current actix
    /// runtime, so building with garbage collection enabled must happen inside one.
    ///
    /// The garbage collector periodically scans the internal map, removing expired windows.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    /// The clock the garbage collector compares window expiries against.
    ///
    /// This should be the same clock given to the [RateLimiterEngine](crate::RateLimiterEngine).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> InMemoryWindowStore {
        let map = Arc::new(DashMap::<String, Window>::new());
        let gc_handle = self.gc_interval.map(|gc_interval| {
            Arc::new(GcHandle(InMemoryWindowStore::garbage_collector(
                map.clone(),
                self.clock.clone(),
                gc_interval,
            )))
        });
        InMemoryWindowStore {
            map,
            _gc_handle: gc_handle,
        }
    }
}
