#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod backend;
pub mod clock;
pub mod config;
mod middleware;
pub mod store;

pub use middleware::builder::{
    too_many_requests, HeaderCompatibleOutput, RateLimiterBuilder, TOO_MANY_REQUESTS_MESSAGE,
};
pub use middleware::{FailurePolicy, RateLimiter};
