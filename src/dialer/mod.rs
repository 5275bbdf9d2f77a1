//! Outbound dialing subsystem.
//!
//! # Data Flow
//! ```text
//! server URL + TETHER_AGENT_HTTP_PROXY_ALLOWED
//!     → environment.rs (HTTP_PROXY / HTTPS_PROXY / NO_PROXY lookup)
//!     → Dialer::from_proxy_url
//!         - http_connect.rs (CONNECT tunnel through an HTTP proxy)
//!         - socks5.rs (SOCKS5 proxy, proxy leg dialed directly)
//!     → DialerHandle::store (atomic swap)
//!     → every LoadBalancer::dial reads a snapshot
//! ```
//!
//! # Design Decisions
//! - The dialer is an explicit handle owned by the composition root, never a global
//! - Reads are lock-free snapshots; replacement happens at configuration time only
//! - A failed configuration leaves the previous dialer in place

pub mod environment;
pub mod http_connect;
pub mod socks5;

use std::io;
use std::sync::Arc;

use arc_swap::ArcSwap;
use percent_encoding::percent_decode_str;
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use url::Url;

pub use environment::ProxyEnvironment;
pub use http_connect::HttpConnectDialer;
pub use socks5::Socks5Dialer;

/// Upper-case product name used to derive environment variable names.
pub const PROGRAM_UPPER: &str = "TETHER";

/// Name of the flag that allows agent connections to use a proxy.
pub fn proxy_allowed_env_var() -> String {
    format!("{}_AGENT_HTTP_PROXY_ALLOWED", PROGRAM_UPPER)
}

/// Errors raised while configuring the outbound dialer.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The server address could not be parsed as a URL.
    #[error("failed to parse address {address}: {source}")]
    ParseAddress {
        address: String,
        #[source]
        source: url::ParseError,
    },

    /// The proxy environment could not be evaluated for the address.
    #[error("failed to get proxy for address {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: Box<ProxyError>,
    },

    /// A dialer could not be built for the resolved proxy.
    #[error("failed to create proxy dialer for {proxy}: {source}")]
    CreateDialer {
        proxy: String,
        #[source]
        source: Box<ProxyError>,
    },

    /// The proxy URL uses a scheme other than http, https or socks5.
    #[error("unsupported proxy scheme: {0}")]
    UnsupportedScheme(String),

    /// The proxy setting is not a usable URL.
    #[error("invalid proxy URL {0:?}")]
    InvalidProxyUrl(String),
}

impl ProxyError {
    /// True when the root cause is an unsupported proxy scheme.
    pub fn is_unsupported_scheme(&self) -> bool {
        match self {
            ProxyError::UnsupportedScheme(_) => true,
            ProxyError::CreateDialer { source, .. } | ProxyError::Resolve { source, .. } => {
                source.is_unsupported_scheme()
            }
            _ => false,
        }
    }
}

/// Produces raw byte-stream connections, directly or through a proxy.
#[derive(Debug, Clone, Default)]
pub enum Dialer {
    #[default]
    Direct,
    HttpConnect(HttpConnectDialer),
    Socks5(Socks5Dialer),
}

impl Dialer {
    /// Build a dialer bound to the proxy's scheme.
    pub fn from_proxy_url(proxy_url: &Url) -> Result<Self, ProxyError> {
        match proxy_url.scheme() {
            "http" | "https" => Ok(Dialer::HttpConnect(HttpConnectDialer::new(proxy_url)?)),
            "socks5" => Ok(Dialer::Socks5(Socks5Dialer::new(proxy_url)?)),
            other => Err(ProxyError::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Dialer::Direct)
    }

    /// Open a connection to `address` (`host:port`).
    ///
    /// The network's address family applies to the first hop: the target for
    /// a direct dial, the proxy itself otherwise. A proxy resolves the target
    /// on its own.
    pub async fn dial(&self, network: &str, address: &str) -> io::Result<TcpStream> {
        let family = Family::from_network(network)?;
        match self {
            Dialer::Direct => dial_direct(family, address).await,
            Dialer::HttpConnect(dialer) => dialer.dial(family, address).await,
            Dialer::Socks5(dialer) => dialer.dial(family, address).await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Family {
    Any,
    V4,
    V6,
}

impl Family {
    fn from_network(network: &str) -> io::Result<Self> {
        match network {
            "tcp" => Ok(Family::Any),
            "tcp4" => Ok(Family::V4),
            "tcp6" => Ok(Family::V6),
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported network {other:?}"),
            )),
        }
    }
}

pub(crate) async fn dial_direct(family: Family, address: &str) -> io::Result<TcpStream> {
    if family == Family::Any {
        return TcpStream::connect(address).await;
    }

    let mut last_err = None;
    for addr in lookup_host(address).await? {
        let wanted = match family {
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
            Family::Any => true,
        };
        if !wanted {
            continue;
        }
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no suitable address found for {address}"),
        )
    }))
}

/// Decoded `user:password` from a proxy URL, or `None` without a user name.
pub(crate) fn proxy_credentials(proxy_url: &Url) -> Result<Option<(String, String)>, ProxyError> {
    if proxy_url.username().is_empty() {
        return Ok(None);
    }
    let decode = |raw: &str| {
        percent_decode_str(raw)
            .decode_utf8()
            .map(|s| s.into_owned())
            .map_err(|_| ProxyError::InvalidProxyUrl(proxy_url.to_string()))
    };
    let user = decode(proxy_url.username())?;
    let password = decode(proxy_url.password().unwrap_or_default())?;
    Ok(Some((user, password)))
}

/// Shared, replaceable dialer read by every dial.
#[derive(Debug)]
pub struct DialerHandle {
    current: ArcSwap<Dialer>,
}

impl DialerHandle {
    /// A handle that dials directly.
    pub fn new() -> Self {
        Self::with_dialer(Dialer::Direct)
    }

    pub fn with_dialer(dialer: Dialer) -> Self {
        Self {
            current: ArcSwap::from_pointee(dialer),
        }
    }

    /// Snapshot of the dialer in effect right now.
    pub fn load(&self) -> Arc<Dialer> {
        self.current.load_full()
    }

    /// Replace the dialer used by all future dials.
    pub fn store(&self, dialer: Dialer) {
        self.current.store(Arc::new(dialer));
    }
}

impl Default for DialerHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Decides whether agent connections go through a proxy and installs the matching dialer.
#[derive(Debug, Clone)]
pub struct ProxyConfigurator {
    dialer: Arc<DialerHandle>,
}

impl ProxyConfigurator {
    pub fn new(dialer: Arc<DialerHandle>) -> Self {
        Self { dialer }
    }

    pub fn dialer(&self) -> &Arc<DialerHandle> {
        &self.dialer
    }

    /// Configure from the process environment.
    pub fn configure(&self, server_url: &str) -> Result<(), ProxyError> {
        let allowed = std::env::var(proxy_allowed_env_var())
            .ok()
            .and_then(|v| parse_bool(&v))
            .unwrap_or(false);
        self.configure_with(server_url, allowed, &ProxyEnvironment::from_env())
    }

    /// Configure from an explicit flag and proxy environment.
    pub fn configure_with(
        &self,
        server_url: &str,
        allowed: bool,
        env: &ProxyEnvironment,
    ) -> Result<(), ProxyError> {
        if !allowed || server_url.is_empty() {
            return Ok(());
        }

        let url = Url::parse(server_url).map_err(|source| ProxyError::ParseAddress {
            address: server_url.to_string(),
            source,
        })?;

        let proxy_url = env.proxy_for(&url).map_err(|e| ProxyError::Resolve {
            address: server_url.to_string(),
            source: Box::new(e),
        })?;

        let Some(proxy_url) = proxy_url else {
            tracing::debug!(
                server = %url,
                "{} is true but no proxy is configured for URL",
                proxy_allowed_env_var()
            );
            return Ok(());
        };

        let dialer = Dialer::from_proxy_url(&proxy_url).map_err(|e| ProxyError::CreateDialer {
            proxy: proxy_url.to_string(),
            source: Box::new(e),
        })?;

        self.dialer.store(dialer);
        tracing::debug!(proxy = %proxy_url, server = %url, "Using proxy for agent connection");
        Ok(())
    }
}

/// Boolean parsing with the conventional accepted spellings.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
