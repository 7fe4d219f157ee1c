use crate::store::{CounterStore, WindowCounts};
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use dashmap::DashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 10;

/// A [CounterStore] that keeps counters in process memory using [DashMap](dashmap::DashMap).
///
/// Counters are only shared between clones of the same store, so this is only suitable when a
/// single process serves all traffic for the rate limited keys.
#[derive(Clone)]
pub struct InMemoryStore {
    map: Arc<DashMap<String, Value>>,
    gc_handle: Option<Arc<JoinHandle<()>>>,
}

struct Value {
    ttl: Instant,
    count: u64,
}

impl InMemoryStore {
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder {
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
        }
    }

    fn garbage_collector(map: Arc<DashMap<String, Value>>, interval: Duration) -> JoinHandle<()> {
        assert!(
            interval.as_secs_f64() > 0f64,
            "GC interval must be non-zero"
        );
        actix_web::rt::spawn(async move {
            loop {
                let now = Instant::now();
                map.retain(|_k, v| v.ttl > now);
                actix_web::rt::time::sleep_until(now + interval).await;
            }
        })
    }

    fn count(&self, key: &str, now: Instant) -> u64 {
        self.map
            .get(key)
            .filter(|v| v.ttl > now)
            .map(|v| v.count)
            .unwrap_or(0)
    }
}

impl CounterStore for InMemoryStore {
    type Error = Infallible;

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, Self::Error> {
        let now = Instant::now();
        let mut count = 1;
        let expiry = now.checked_add(ttl).expect("TTL unexpectedly large");
        self.map
            .entry(key.to_owned())
            .and_modify(|v| {
                if v.ttl > now {
                    v.count += 1;
                    count = v.count;
                } else {
                    // Expired but not yet collected, start again
                    v.ttl = expiry;
                    v.count = count;
                }
            })
            .or_insert_with(|| Value { ttl: expiry, count });
        Ok(count)
    }

    async fn decrement(&self, key: &str) -> Result<(), Self::Error> {
        if let Some(mut v) = self.map.get_mut(key) {
            v.count = v.count.saturating_sub(1);
        }
        Ok(())
    }

    async fn window_counts(
        &self,
        current_key: &str,
        previous_key: &str,
    ) -> Result<WindowCounts, Self::Error> {
        let now = Instant::now();
        Ok(WindowCounts {
            current: self.count(current_key, now),
            previous: self.count(previous_key, now),
        })
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), Self::Error> {
        for key in keys {
            self.map.remove(*key);
        }
        Ok(())
    }

    async fn time(&self) -> Result<Option<Duration>, Self::Error> {
        Ok(None)
    }
}

impl Drop for InMemoryStore {
    fn drop(&mut self) {
        if let Some(handle) = &self.gc_handle {
            // Only the last clone stops the collector
            if Arc::strong_count(handle) == 1 {
                handle.abort();
            }
        }
    }
}

pub struct InMemoryStoreBuilder {
    gc_interval: Option<Duration>,
}

impl InMemoryStoreBuilder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection.
    ///
    /// The garbage collector periodically scans the internal map, removing expired counters.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn build(self) -> InMemoryStore {
        let map = Arc::new(DashMap::<String, Value>::new());
        let gc_handle = self
            .gc_interval
            .map(|gc_interval| Arc::new(InMemoryStore::garbage_collector(map.clone(), gc_interval)));
        InMemoryStore { map, gc_handle }
    }
}
