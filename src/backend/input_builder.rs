use crate::backend::SimpleInput;
use actix_web::dev::ServiceRequest;
use actix_web::http::header::HeaderName;
use once_cell::sync::Lazy;
use std::future::{ready, Ready};
use std::net::{AddrParseError, IpAddr, Ipv6Addr};
use std::time::Duration;

type CustomFn = Box<dyn Fn(&ServiceRequest) -> Result<String, actix_web::Error>>;

/// Resolves to `None` when the client could not be identified.
pub type SimpleInputFuture = Ready<Result<Option<SimpleInput>, actix_web::Error>>;

static X_REAL_IP: Lazy<HeaderName> = Lazy::new(|| HeaderName::from_static("x-real-ip"));

static X_FORWARDED_FOR: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-forwarded-for"));

/// Where to look for the client's IP address.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IpSource {
    /// The address of the connected peer.
    Peer,
    /// The `x-real-ip` header.
    RealIpHeader,
    /// The first entry of the comma separated `x-forwarded-for` header.
    ForwardedFor,
}

pub const DEFAULT_IP_SOURCES: [IpSource; 3] =
    [IpSource::Peer, IpSource::RealIpHeader, IpSource::ForwardedFor];

/// Utility to create an input function that produces a [SimpleInput] keyed on the client IP.
///
/// The IP sources are tried in order and the first non-empty one wins. If none of them yield an
/// address the input function resolves to `None` and the request is not rate limited at all.
///
/// # Security
///
/// Clients behind a shared NAT or proxy share an IP, and therefore share a quota. The
/// `x-real-ip` and `x-forwarded-for` headers can be set by anyone; only use them when the
/// application sits behind a proxy that you control and which overwrites them.
pub struct SimpleInputFunctionBuilder {
    interval: Duration,
    max_requests: u64,
    ip_sources: Vec<IpSource>,
    group_ipv6: bool,
    path_key: bool,
    custom_key: Option<String>,
    custom_fn: Option<CustomFn>,
}

impl SimpleInputFunctionBuilder {
    pub fn new(interval: Duration, max_requests: u64) -> Self {
        Self {
            interval,
            max_requests,
            ip_sources: DEFAULT_IP_SOURCES.to_vec(),
            group_ipv6: false,
            path_key: false,
            custom_key: None,
            custom_fn: None,
        }
    }

    /// Override the order (and selection) of places the client IP is read from.
    ///
    /// Defaults to [DEFAULT_IP_SOURCES].
    pub fn ip_sources(mut self, sources: &[IpSource]) -> Self {
        self.ip_sources = sources.to_vec();
        self
    }

    /// Group IPv6 addresses into a single key per /64.
    pub fn group_ipv6_subnets(mut self) -> Self {
        self.group_ipv6 = true;
        self
    }

    /// Add the request path to the rate limiting key
    pub fn path_key(mut self) -> Self {
        self.path_key = true;
        self
    }

    /// Add a custom component to the rate limiting key
    pub fn custom_key(mut self, key: &str) -> Self {
        self.custom_key = Some(key.to_owned());
        self
    }

    /// Dynamically add a custom component to the rate limiting key
    pub fn custom_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Result<String, actix_web::Error> + 'static,
    {
        self.custom_fn = Some(Box::new(f));
        self
    }

    pub fn build(self) -> impl Fn(&ServiceRequest) -> SimpleInputFuture + 'static {
        move |req| {
            ready((|| {
                let ip = match client_ip(req, &self.ip_sources) {
                    Some(ip) => ip,
                    None => return Ok(None),
                };
                let ip = if self.group_ipv6 {
                    ip_key(&ip).unwrap_or(ip)
                } else {
                    ip
                };

                let mut components = Vec::new();
                if let Some(custom) = &self.custom_key {
                    components.push(custom.clone());
                }
                components.push(ip);
                if self.path_key {
                    components.push(req.path().to_owned());
                }
                if let Some(f) = &self.custom_fn {
                    components.push(f(req)?)
                }
                let key = components.join("-");

                Ok(Some(SimpleInput {
                    interval: self.interval,
                    max_requests: self.max_requests,
                    key,
                }))
            })())
        }
    }
}

/// Find the client IP using the given sources, in order.
pub fn client_ip(req: &ServiceRequest, sources: &[IpSource]) -> Option<String> {
    sources.iter().find_map(|source| match source {
        IpSource::Peer => req.peer_addr().map(|addr| addr.ip().to_string()),
        IpSource::RealIpHeader => header_str(req, &X_REAL_IP).map(ToOwned::to_owned),
        IpSource::ForwardedFor => header_str(req, &X_FORWARDED_FOR)
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(ToOwned::to_owned),
    })
}

fn header_str<'r>(req: &'r ServiceRequest, name: &HeaderName) -> Option<&'r str> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

// Groups IPv6 addresses together, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
fn ip_key(ip_str: &str) -> Result<String, AddrParseError> {
    let ip = ip_str.parse::<IpAddr>()?;
    Ok(match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return Ok(v4.to_string());
            }
            let s = v6.segments();
            let subnet = Ipv6Addr::new(s[0], s[1], s[2], s[3], 0, 0, 0, 0);
            format!("{}/64", subnet)
        }
    })
}
