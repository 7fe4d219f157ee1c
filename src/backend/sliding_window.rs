use crate::backend::{Backend, Decision, LimitDecision, SimpleBackend, SimpleInput};
use crate::clock::{Clock, SystemClock};
use crate::store::CounterStore;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use thiserror::Error;

pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(#[source] Box<dyn std::error::Error>),
    #[error("Counter store did not respond within {0:?}")]
    Timeout(Duration),
    #[error("Rate limit interval must be at least one millisecond")]
    InvalidInterval,
}

/// Which clock decides the window a request falls into.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimeSource {
    /// The local [Clock] of this process.
    Local,
    /// The counter store's clock, falling back to the local clock if the store doesn't have one.
    ///
    /// Costs an extra round trip per request, but keeps window boundaries consistent between
    /// processes whose clocks have drifted apart.
    Store,
}

/// A Sliding Window rate limiter [Backend] that keeps its counters in a [CounterStore].
///
/// Time is divided into fixed windows of `interval`. A request is admitted if the number of
/// requests counted in the current window, plus the previous window's count weighted by how much
/// of it still overlaps the trailing `interval`, is below `max_requests`.
///
/// The backend itself holds no counters, so any number of processes may share a store.
///
/// A client that used up its quota right at the start of a window is still limited at the very
/// start of the next one, where the previous window is weighted in full. It is allowed again one
/// millisecond later, once the weight drops below one.
#[derive(Clone)]
pub struct SlidingWindowBackend<S> {
    store: S,
    clock: Arc<dyn Clock>,
    time_source: TimeSource,
    key_prefix: String,
    timeout: Duration,
}

impl<S: CounterStore> SlidingWindowBackend<S> {
    /// Create a SlidingWindowBackendBuilder.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use actix_sliding_rate_limit::backend::SlidingWindowBackend;
    /// # use actix_sliding_rate_limit::store::memory::InMemoryStore;
    /// # use std::time::Duration;
    /// # async fn example() {
    /// let backend = SlidingWindowBackend::builder(InMemoryStore::builder().build())
    ///     .timeout(Duration::from_millis(500))
    ///     .build();
    /// let decision = backend
    ///     .limit("203.0.113.7", 3, Duration::from_secs(60))
    ///     .await
    ///     .unwrap();
    /// # };
    /// ```
    pub fn builder(store: S) -> SlidingWindowBackendBuilder<S> {
        SlidingWindowBackendBuilder {
            store,
            clock: Arc::new(SystemClock),
            time_source: TimeSource::Local,
            key_prefix: DEFAULT_KEY_PREFIX.to_owned(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Check and count a single request for `identifier`.
    pub async fn limit(
        &self,
        identifier: &str,
        quota: u64,
        window: Duration,
    ) -> Result<LimitDecision, Error> {
        let input = SimpleInput {
            interval: window,
            max_requests: quota,
            key: identifier.to_owned(),
        };
        let (_, decision, _) = self.request(input).await?;
        Ok(decision)
    }

    // The quota and interval are part of the key, so that changing the policy starts new
    // counters rather than reinterpreting old ones.
    fn make_key(&self, input: &SimpleInput, window_id: u64) -> String {
        format!(
            "{}{}r{}ms:{}:{}",
            self.key_prefix,
            input.max_requests,
            input.interval.as_millis(),
            input.key,
            window_id
        )
    }

    async fn call<T, F>(&self, operation: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, S::Error>>,
    {
        match actix_web::rt::time::timeout(self.timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::StoreUnavailable(Box::new(e))),
            Err(_) => Err(Error::Timeout(self.timeout)),
        }
    }

    async fn now(&self) -> Result<Duration, Error> {
        if self.time_source == TimeSource::Store {
            if let Some(now) = self.call(self.store.time()).await? {
                return Ok(now);
            }
        }
        Ok(self.clock.now())
    }
}

/// Position of an instant within the fixed windows of a given length (all in milliseconds).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Window {
    id: u64,
    elapsed: u64,
    length: u64,
}

impl Window {
    fn locate(now: Duration, interval: Duration) -> Result<Self, Error> {
        let length = u64::try_from(interval.as_millis()).map_err(|_| Error::InvalidInterval)?;
        if length == 0 {
            return Err(Error::InvalidInterval);
        }
        let now = u64::try_from(now.as_millis()).map_err(|_| Error::InvalidInterval)?;
        Ok(Self {
            id: now / length,
            elapsed: now % length,
            length,
        })
    }

    /// The previous window's count scaled by the fraction of it still inside the sliding window.
    fn weigh_previous(&self, previous: u64) -> u64 {
        let overlap = (self.length - self.elapsed) as u128;
        (previous as u128 * overlap / self.length as u128) as u64
    }

    fn reset_after(&self) -> Duration {
        Duration::from_millis(self.length - self.elapsed)
    }

    fn reset_at_millis(&self) -> u64 {
        self.id.saturating_add(1).saturating_mul(self.length)
    }
}

impl<S: CounterStore> Backend<SimpleInput> for SlidingWindowBackend<S> {
    type Output = LimitDecision;
    type RollbackToken = String;
    type Error = Error;

    async fn request(
        &self,
        input: SimpleInput,
    ) -> Result<(Decision, Self::Output, Self::RollbackToken), Self::Error> {
        let window = Window::locate(self.now().await?, input.interval)?;
        let current_key = self.make_key(&input, window.id);
        // Window 0 has no predecessor, wrapping gives a key that is never written
        let previous_key = self.make_key(&input, window.id.wrapping_sub(1));

        let denied = LimitDecision {
            allowed: false,
            limit: input.max_requests,
            remaining: 0,
            reset_at: UNIX_EPOCH + Duration::from_millis(window.reset_at_millis()),
            reset_after: window.reset_after(),
        };

        let counts = self
            .call(self.store.window_counts(&current_key, &previous_key))
            .await?;
        let previous = window.weigh_previous(counts.previous);
        if previous.saturating_add(counts.current) >= input.max_requests {
            return Ok((Decision::Denied, denied, current_key));
        }

        let ttl = input.interval.saturating_mul(2);
        let count = self.call(self.store.increment(&current_key, ttl)).await?;
        // Others may have been counted between the read and the increment
        let estimated = previous.saturating_add(count.saturating_sub(1));
        if estimated >= input.max_requests {
            log::debug!("Lost the race for the last request in {current_key}");
            if let Err(e) = self.call(self.store.decrement(&current_key)).await {
                log::error!("Unable to compensate rate limit count for {current_key}: {e}");
            }
            return Ok((Decision::Denied, denied, current_key));
        }

        let output = LimitDecision {
            allowed: true,
            remaining: input.max_requests.saturating_sub(estimated + 1),
            ..denied
        };
        Ok((Decision::Allowed, output, current_key))
    }

    async fn rollback(&self, token: Self::RollbackToken) -> Result<(), Self::Error> {
        self.call(self.store.decrement(&token)).await
    }
}

impl<S: CounterStore> SimpleBackend for SlidingWindowBackend<S> {
    /// Note that the key prefix and policy fingerprint are automatically included, `input.key`
    /// should be the plain identifier.
    async fn reset(&self, input: &SimpleInput) -> Result<(), Self::Error> {
        let window = Window::locate(self.now().await?, input.interval)?;
        let current_key = self.make_key(input, window.id);
        let previous_key = self.make_key(input, window.id.wrapping_sub(1));
        self.call(self.store.remove(&[current_key.as_str(), previous_key.as_str()]))
            .await
    }
}

pub struct SlidingWindowBackendBuilder<S> {
    store: S,
    clock: Arc<dyn Clock>,
    time_source: TimeSource,
    key_prefix: String,
    timeout: Duration,
}

impl<S: CounterStore> SlidingWindowBackendBuilder<S> {
    /// Apply a prefix to all keys written by this backend.
    ///
    /// The prefix is used as a 'namespace' to avoid collision with other keys in a shared store.
    /// Defaults to [DEFAULT_KEY_PREFIX].
    pub fn key_prefix(mut self, key_prefix: &str) -> Self {
        self.key_prefix = key_prefix.to_owned();
        self
    }

    /// Upper bound on each individual call to the store.
    ///
    /// Defaults to [DEFAULT_TIMEOUT]. A call that times out is abandoned; if it was an increment
    /// that reached the store, that request stays counted.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Defaults to [TimeSource::Local].
    pub fn time_source(mut self, time_source: TimeSource) -> Self {
        self.time_source = time_source;
        self
    }

    /// Replace the local clock, defaults to [SystemClock].
    pub fn clock<C: Clock>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> SlidingWindowBackend<S> {
        SlidingWindowBackend {
            store: self.store,
            clock: self.clock,
            time_source: self.time_source,
            key_prefix: self.key_prefix,
            timeout: self.timeout,
        }
    }
}
