//! Environment driven configuration for the sliding window rate limiter.

use crate::backend::{
    LimitDecision, SimpleInputFunctionBuilder, SimpleInputFuture, SlidingWindowBackend,
    DEFAULT_KEY_PREFIX,
};
use crate::middleware::{FailurePolicy, RateLimiter};
use crate::store::CounterStore;
use actix_web::dev::ServiceRequest;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use thiserror::Error;

pub const URL_VAR: &str = "UPSTASH_REDIS_REST_URL";
pub const TOKEN_VAR: &str = "UPSTASH_REDIS_REST_TOKEN";
pub const QUOTA_VAR: &str = "RATE_LIMIT_QUOTA";
pub const WINDOW_VAR: &str = "RATE_LIMIT_WINDOW";
pub const SCOPES_VAR: &str = "RATE_LIMIT_SCOPES";
pub const FAILURE_POLICY_VAR: &str = "RATE_LIMIT_FAILURE_POLICY";
pub const TIMEOUT_VAR: &str = "RATE_LIMIT_TIMEOUT_MS";
pub const PREFIX_VAR: &str = "RATE_LIMIT_PREFIX";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable {0}")]
    MissingVar(&'static str),
    #[error("Invalid number for {var}: {value:?}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("Invalid window {0:?}, expected e.g. \"1 m\" or \"500ms\"")]
    InvalidWindow(String),
    #[error("Invalid failure policy {0:?}, expected \"open\" or \"closed\"")]
    InvalidPolicy(String),
    #[error("Quota must be at least 1")]
    ZeroQuota,
    #[error("Window must be at least one millisecond")]
    ZeroWindow,
    #[error("Unable to build counter store: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Rate limiter settings.
///
/// The defaults allow 3 requests per client per minute under `/api`. There is no default
/// failure policy, it must always be chosen explicitly.
///
/// Settings read through [Deserialize] are not validated until [Settings::validate] or
/// [Settings::rate_limiter] is called.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Base URL of the REST counter store
    pub url: Option<String>,

    /// Bearer token for the REST counter store
    pub token: Option<String>,

    /// Requests allowed per client per window
    #[serde(default = "default_quota")]
    pub quota: u64,

    /// Length of the sliding window
    #[serde(
        default = "default_window",
        deserialize_with = "deserialize_window"
    )]
    pub window: Duration,

    /// Path prefixes that are rate limited, empty means every path
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    pub failure_policy: FailurePolicy,

    /// Upper bound on each store call
    #[serde(default = "default_timeout", deserialize_with = "deserialize_millis")]
    pub timeout: Duration,

    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_quota() -> u64 {
    3
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_scopes() -> Vec<String> {
    vec!["/api".to_owned()]
}

fn default_timeout() -> Duration {
    crate::backend::DEFAULT_TIMEOUT
}

fn default_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_owned()
}

fn deserialize_window<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let s = String::deserialize(deserializer)?;
    parse_window(&s).map_err(serde::de::Error::custom)
}

fn deserialize_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_millis(u64::deserialize(deserializer)?))
}

/// Parses a window such as `"1 m"`, `"30s"` or `"500 ms"`.
///
/// Supported units are `ms`, `s`, `m`, `h` and `d`.
pub fn parse_window(s: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidWindow(s.to_owned());
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
    let (amount, unit) = s.split_at(split);
    let amount: u64 = amount.parse().map_err(|_| invalid())?;
    let millis = match unit.trim() {
        "ms" => Some(amount),
        "s" => amount.checked_mul(1000),
        "m" => amount.checked_mul(60 * 1000),
        "h" => amount.checked_mul(60 * 60 * 1000),
        "d" => amount.checked_mul(24 * 60 * 60 * 1000),
        _ => None,
    }
    .ok_or_else(invalid)?;
    if millis == 0 {
        return Err(ConfigError::ZeroWindow);
    }
    Ok(Duration::from_millis(millis))
}

fn parse_number(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber {
            var,
            value: value.to_owned(),
        })
}

impl Settings {
    /// Load the settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load the settings from an arbitrary variable lookup.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let failure_policy = match lookup(FAILURE_POLICY_VAR) {
            None => return Err(ConfigError::MissingVar(FAILURE_POLICY_VAR)),
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "open" => FailurePolicy::Open,
                "closed" => FailurePolicy::Closed,
                _ => return Err(ConfigError::InvalidPolicy(value)),
            },
        };
        let quota = match lookup(QUOTA_VAR) {
            Some(value) => parse_number(QUOTA_VAR, &value)?,
            None => default_quota(),
        };
        let window = match lookup(WINDOW_VAR) {
            Some(value) => parse_window(&value)?,
            None => default_window(),
        };
        let scopes = match lookup(SCOPES_VAR) {
            Some(value) => value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
            None => default_scopes(),
        };
        let timeout = match lookup(TIMEOUT_VAR) {
            Some(value) => Duration::from_millis(parse_number(TIMEOUT_VAR, &value)?),
            None => default_timeout(),
        };
        let settings = Self {
            url: lookup(URL_VAR),
            token: lookup(TOKEN_VAR),
            quota,
            window,
            scopes,
            failure_policy,
            timeout,
            prefix: lookup(PREFIX_VAR).unwrap_or_else(default_prefix),
        };
        settings.validate()?;
        log::debug!(
            "Rate limiting {:?} to {} requests per {:?}, failing {:?}",
            settings.scopes,
            settings.quota,
            settings.window,
            settings.failure_policy
        );
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quota == 0 {
            return Err(ConfigError::ZeroQuota);
        }
        if self.window.as_millis() == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        Ok(())
    }

    /// Build the REST counter store from the URL and token.
    #[cfg(feature = "rest")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rest")))]
    pub fn rest_store(&self) -> Result<crate::store::rest::RestStore, ConfigError> {
        let url = self.url.as_deref().ok_or(ConfigError::MissingVar(URL_VAR))?;
        let token = self
            .token
            .as_deref()
            .ok_or(ConfigError::MissingVar(TOKEN_VAR))?;
        crate::store::rest::RestStore::builder(url, token)
            .timeout(self.timeout)
            .build()
            .map_err(|e| ConfigError::Store(Box::new(e)))
    }

    /// Build the middleware over `store`, keyed by client IP, with the rate limit headers added.
    ///
    /// The settings are validated first, since those read through [Deserialize] are not.
    pub fn rate_limiter<S: CounterStore>(
        &self,
        store: S,
    ) -> Result<
        RateLimiter<
            SlidingWindowBackend<S>,
            LimitDecision,
            impl Fn(&ServiceRequest) -> SimpleInputFuture + 'static,
        >,
        ConfigError,
    > {
        self.validate()?;
        let backend = SlidingWindowBackend::builder(store)
            .key_prefix(&self.prefix)
            .timeout(self.timeout)
            .build();
        let input = SimpleInputFunctionBuilder::new(self.window, self.quota).build();
        let mut builder =
            RateLimiter::builder(backend, input, self.failure_policy).add_headers();
        for scope in &self.scopes {
            builder = builder.scope(scope);
        }
        Ok(builder.build())
    }
}
