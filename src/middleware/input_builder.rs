use crate::middleware::RateLimitInput;
use crate::policy::QuotaPolicy;
use actix_web::dev::ServiceRequest;
use actix_web::http::header::HeaderName;
use actix_web::ResponseError;
use std::future::{ready, Ready};
use std::net::{AddrParseError, IpAddr, Ipv6Addr};
use thiserror::Error;

type CustomFn = Box<dyn Fn(&ServiceRequest) -> Result<String, actix_web::Error>>;

pub type SimpleInputFuture = Ready<Result<RateLimitInput, actix_web::Error>>;

/// Utility to create a input function that produces a [RateLimitInput] with a fixed policy.
///
/// Key components are joined with `:`. You should take care to ensure that you are producing
/// unique keys per policy.
///
/// This will not be of any use if you want to use dynamic policies per key or perform an
/// asynchronous operation; you should instead write your own input function.
pub struct SimpleInputFunctionBuilder {
    policy: QuotaPolicy,
    api_key_header: Option<HeaderName>,
    real_ip_key: bool,
    peer_ip_key: bool,
    path_key: bool,
    custom_key: Option<String>,
    custom_fn: Option<CustomFn>,
}

impl SimpleInputFunctionBuilder {
    pub fn new(policy: QuotaPolicy) -> Self {
        Self {
            policy,
            api_key_header: None,
            real_ip_key: false,
            peer_ip_key: false,
            path_key: false,
            custom_key: None,
            custom_fn: None,
        }
    }

    /// Adds the API key sent in `header` to the rate limiting key as `key:<value>`.
    ///
    /// Requests without the header are identified by their connection peer instead, as
    /// `ip:<address>`.
    pub fn api_key_header(mut self, header: HeaderName) -> Self {
        self.api_key_header = Some(header);
        self
    }

    /// Adds the client's real IP to the rate limiting key.
    ///
    /// # Security
    ///
    /// This calls
    /// [ConnectionInfo::realip_remote_addr()](actix_web::dev::ConnectionInfo::realip_remote_addr)
    /// internally which is only suitable for Actix applications deployed behind a proxy that you
    /// control.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses will be grouped into a single key per /64
    pub fn real_ip_key(mut self) -> Self {
        self.real_ip_key = true;
        self
    }

    /// Adds the connection peer IP to the rate limiting key.
    ///
    /// This is suitable when clients connect directly to the Actix application.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses will be grouped into a single key per /64
    pub fn peer_ip_key(mut self) -> Self {
        self.peer_ip_key = true;
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
                let mut components = Vec::new();
                let info = req.connection_info();
                if let Some(custom) = &self.custom_key {
                    components.push(custom.clone());
                }
                if let Some(header) = &self.api_key_header {
                    let api_key = req
                        .headers()
                        .get(header)
                        .and_then(|v| v.to_str().ok())
                        .filter(|v| !v.is_empty());
                    components.push(match api_key {
                        Some(api_key) => format!("key:{api_key}"),
                        None => format!("ip:{}", ip_key(info.peer_addr())?),
                    });
                }
                if self.real_ip_key {
                    components.push(ip_key(info.realip_remote_addr())?)
                }
                if self.peer_ip_key {
                    components.push(ip_key(info.peer_addr())?)
                }
                if self.path_key {
                    components.push(req.path().to_owned());
                }
                if let Some(f) = &self.custom_fn {
                    components.push(f(req)?)
                }
                let key = components.join(":");

                Ok(RateLimitInput {
                    key,
                    policy: self.policy,
                })
            })())
        }
    }
}

#[derive(Debug, Error)]
enum Error {
    #[error("Unable to parse remote IP address: {0}")]
    InvalidIpError(
        #[source]
        #[from]
        AddrParseError,
    ),
    #[error("Remote IP address is unknown")]
    MissingIpError,
}

impl ResponseError for Error {}

// Groups IPv6 addresses together, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
// https://support.cloudflare.com/hc/en-us/articles/115001635128-Configuring-Cloudflare-Rate-Limiting
fn ip_key(ip_str: Option<&str>) -> Result<String, Error> {
    let ip = ip_str.ok_or(Error::MissingIpError)?.parse::<IpAddr>()?;
    Ok(match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4() {
                return Ok(v4.to_string());
            }
            let s = v6.segments();
            let subnet = Ipv6Addr::new(s[0], s[1], s[2], s[3], 0, 0, 0, 0);
            format!("{}/64", subnet)
        }
    })
}
