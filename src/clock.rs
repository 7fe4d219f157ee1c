use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of wall clock time used to place requests into rate limit windows.
///
/// Every process sharing a counter store must agree on window boundaries, so the time is an
/// absolute duration since the Unix epoch rather than a process-local [Instant](std::time::Instant).
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Duration;
}

/// The operating system clock.
#[derive(Debug, Copy, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(now: Duration) -> Self {
        Self(Arc::new(AtomicU64::new(now.as_millis() as u64)))
    }

    pub fn set(&self, now: Duration) {
        self.0.store(now.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.0.load(Ordering::SeqCst))
    }
}
