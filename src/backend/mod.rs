mod input_builder;
mod sliding_window;

pub use input_builder::{
    client_ip, IpSource, SimpleInputFunctionBuilder, SimpleInputFuture, DEFAULT_IP_SOURCES,
};
pub use sliding_window::{
    Error, SlidingWindowBackend, SlidingWindowBackendBuilder, TimeSource, DEFAULT_KEY_PREFIX,
    DEFAULT_TIMEOUT,
};

use crate::HeaderCompatibleOutput;
use std::future::Future;
use std::time::{Duration, SystemTime};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn from_allowed(allowed: bool) -> Self {
        if allowed {
            Self::Allowed
        } else {
            Self::Denied
        }
    }

    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn is_denied(self) -> bool {
        matches!(self, Self::Denied)
    }
}

/// Describes an implementation of a rate limiting algorithm.
///
/// A Backend is required to implement [Clone], usually this means wrapping your data store within
/// an [Arc](std::sync::Arc), although many connection pools already do so internally; there is no
/// need to wrap it twice.
pub trait Backend<I: 'static = SimpleInput>: Clone {
    type Output;
    type RollbackToken;
    type Error;

    /// Process an incoming request.
    ///
    /// The input could include such things as a rate limit key, and the rate limit policy to be
    /// applied.
    ///
    /// Returns a decision of whether to allow or deny the request, arbitrary output that can be
    /// used to transform the allowed and denied responses, and a token to allow the rate limit
    /// counter to be rolled back in certain conditions.
    fn request(
        &self,
        input: I,
    ) -> impl Future<Output = Result<(Decision, Self::Output, Self::RollbackToken), Self::Error>>;

    /// Under certain conditions we may not want to count a request that was already allowed.
    ///
    /// E.g. We may want to exclude 5xx errors from counting against a user's rate limit,
    /// we can only exclude them after having already allowed the request through the rate limiter
    /// in the first place, so we must therefore deduct from the rate limit counter afterwards.
    ///
    /// Note that if this function fails there is not much the [RateLimiter](crate::RateLimiter)
    /// can do about it, given that the request has already been allowed.
    ///
    /// # Arguments
    ///
    /// * `token`: The token returned from the initial call to [Backend::request()].
    fn rollback(&self, token: Self::RollbackToken)
        -> impl Future<Output = Result<(), Self::Error>>;
}

/// A default [Backend] Input structure.
#[derive(Debug, Clone)]
pub struct SimpleInput {
    /// The length of the sliding window.
    pub interval: Duration,
    /// The total requests to be allowed within any window of length `interval`.
    pub max_requests: u64,
    /// The identifier being rate limited, e.g. the client IP.
    pub key: String,
}

/// The result of a single rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitDecision {
    /// Whether the request was admitted.
    pub allowed: bool,
    /// Total number of requests that are permitted within the window.
    pub limit: u64,
    /// Number of further requests that would currently be permitted.
    pub remaining: u64,
    /// Start of the next fixed window.
    pub reset_at: SystemTime,
    /// Time from the decision until `reset_at`.
    pub reset_after: Duration,
}

/// Additional functions for a [Backend] that uses [SimpleInput] and [LimitDecision].
pub trait SimpleBackend: Backend<SimpleInput, Output = LimitDecision> {
    /// Removes all counters for the identifier and policy in `input`.
    ///
    /// Intended to be used to reset a client, or to clean up before changing the interval.
    fn reset(&self, input: &SimpleInput) -> impl Future<Output = Result<(), Self::Error>>;
}

impl HeaderCompatibleOutput for LimitDecision {
    fn limit(&self) -> u64 {
        self.limit
    }

    fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Seconds until the rate limit resets (rounded upwards, so that it is guaranteed to be reset
    /// after waiting for the duration).
    fn seconds_until_reset(&self) -> u64 {
        let millis = self.reset_after.as_millis() as f64;
        (millis / 1000f64).ceil() as u64
    }
}
