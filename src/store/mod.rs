#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod memory;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;

#[cfg(feature = "rest")]
#[cfg_attr(docsrs, doc(cfg(feature = "rest")))]
pub mod rest;

#[cfg(all(test, feature = "dashmap"))]
pub(crate) mod testing;

use std::future::Future;
use std::time::Duration;

// Decrements only an existing, positive counter, so that a late decrement can never leave a
// negative key without an expiry behind.
#[cfg_attr(not(any(feature = "redis", feature = "rest")), allow(dead_code))]
pub(crate) const DECREMENT_SCRIPT: &str = "\
local count = tonumber(redis.call('GET', KEYS[1]))
if count and count > 0 then
  return redis.call('DECR', KEYS[1])
end
return 0";

/// Counts read from the two windows that make up a sliding window.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct WindowCounts {
    /// Requests counted in the window containing "now".
    pub current: u64,
    /// Requests counted in the window immediately before it.
    pub previous: u64,
}

/// A shared key-value store holding integer counters with expiry.
///
/// The [SlidingWindowBackend](crate::backend::SlidingWindowBackend) keeps no state of its own,
/// so every implementation must apply [CounterStore::increment] as a single atomic operation that
/// is visible to all other processes using the same store.
///
/// A store is required to implement [Clone]; cloning should be cheap and produce a handle to the
/// same underlying connection pool or client.
pub trait CounterStore: Clone + 'static {
    type Error: std::error::Error + 'static;

    /// Atomically increment the counter at `key`, returning the new value.
    ///
    /// If the key did not previously exist it must be created with the given time-to-live; the
    /// expiry of an existing key must not be extended.
    fn increment(&self, key: &str, ttl: Duration)
        -> impl Future<Output = Result<u64, Self::Error>>;

    /// Compensate a previous [CounterStore::increment].
    ///
    /// The counter must never become negative, and a key that no longer exists must not be
    /// re-created without an expiry.
    fn decrement(&self, key: &str) -> impl Future<Output = Result<(), Self::Error>>;

    /// Read the counters for the current and previous windows in a single round trip.
    ///
    /// Missing keys read as zero.
    fn window_counts(
        &self,
        current_key: &str,
        previous_key: &str,
    ) -> impl Future<Output = Result<WindowCounts, Self::Error>>;

    /// Delete the given keys.
    fn remove(&self, keys: &[&str]) -> impl Future<Output = Result<(), Self::Error>>;

    /// The store's own wall clock, as a duration since the Unix epoch.
    ///
    /// Stores without a clock return `None`.
    fn time(&self) -> impl Future<Output = Result<Option<Duration>, Self::Error>>;
}
